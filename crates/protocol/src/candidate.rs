use std::fmt;

use thiserror::Error;

/// Minimum whitespace-separated tokens for a candidate line to be usable.
const MIN_CANDIDATE_TOKENS: usize = 8;

#[derive(Debug, Error)]
pub enum CandidateParseError {
    #[error("candidate line has {0} tokens, expected at least {MIN_CANDIDATE_TOKENS}")]
    TooShort(usize),
    #[error("foundation token '{0}' is missing the 'candidate:' prefix")]
    BadFoundation(String),
    #[error("invalid {field} '{value}'")]
    BadNumber { field: &'static str, value: String },
}

/// A structurally validated ICE candidate line.
///
/// Inbound candidates are parsed before they are handed to the transport so
/// garbage from a misbehaving client is dropped early instead of surfacing
/// as an opaque ICE failure later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    /// Candidate type: host, srflx, prflx or relay
    pub typ: String,
}

impl ParsedCandidate {
    /// Parse a candidate line such as
    /// `candidate:4234997325 1 udp 2043278322 192.168.0.56 44323 typ host`.
    pub fn parse(line: &str) -> Result<Self, CandidateParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < MIN_CANDIDATE_TOKENS {
            return Err(CandidateParseError::TooShort(tokens.len()));
        }

        let foundation = tokens[0]
            .split_once(':')
            .map(|(_, suffix)| suffix.to_string())
            .ok_or_else(|| CandidateParseError::BadFoundation(tokens[0].to_string()))?;

        Ok(Self {
            foundation,
            component: parse_number("component", tokens[1])?,
            protocol: tokens[2].to_string(),
            priority: parse_number("priority", tokens[3])?,
            address: tokens[4].to_string(),
            port: parse_number("port", tokens[5])?,
            typ: tokens[7].to_string(),
        })
    }
}

impl fmt::Display for ParsedCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.typ
        )
    }
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, CandidateParseError> {
    value.parse().map_err(|_| CandidateParseError::BadNumber {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_LINE: &str = "candidate:4234997325 1 udp 2043278322 192.168.0.56 44323 typ host";

    #[test]
    fn parses_host_candidate() {
        let c = ParsedCandidate::parse(HOST_LINE).unwrap();
        assert_eq!(c.foundation, "4234997325");
        assert_eq!(c.component, 1);
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.priority, 2043278322);
        assert_eq!(c.address, "192.168.0.56");
        assert_eq!(c.port, 44323);
        assert_eq!(c.typ, "host");
    }

    #[test]
    fn parses_srflx_candidate_with_extra_tokens() {
        let line = "candidate:842163049 1 udp 1677729535 203.0.113.10 61041 typ srflx \
                    raddr 192.168.0.56 rport 44323 generation 0";
        let c = ParsedCandidate::parse(line).unwrap();
        assert_eq!(c.typ, "srflx");
        assert_eq!(c.address, "203.0.113.10");
    }

    #[test]
    fn seven_tokens_is_too_short() {
        let line = "candidate:1 1 udp 2043278322 192.168.0.56 44323 typ";
        let err = ParsedCandidate::parse(line).unwrap_err();
        assert!(matches!(err, CandidateParseError::TooShort(7)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ParsedCandidate::parse("not a candidate").is_err());
        assert!(ParsedCandidate::parse("").is_err());
    }

    #[test]
    fn missing_foundation_prefix_is_rejected() {
        let line = "4234997325 1 udp 2043278322 192.168.0.56 44323 typ host";
        let err = ParsedCandidate::parse(line).unwrap_err();
        assert!(matches!(err, CandidateParseError::BadFoundation(_)));
    }

    #[test]
    fn non_numeric_fields_are_rejected() {
        let bad_port = "candidate:1 1 udp 2043278322 192.168.0.56 high typ host";
        assert!(matches!(
            ParsedCandidate::parse(bad_port).unwrap_err(),
            CandidateParseError::BadNumber { field: "port", .. }
        ));

        let bad_priority = "candidate:1 1 udp urgent 192.168.0.56 44323 typ host";
        assert!(matches!(
            ParsedCandidate::parse(bad_priority).unwrap_err(),
            CandidateParseError::BadNumber {
                field: "priority",
                ..
            }
        ));
    }

    #[test]
    fn render_then_parse_roundtrips() {
        let parsed = ParsedCandidate::parse(HOST_LINE).unwrap();
        let rendered = parsed.to_string();
        let reparsed = ParsedCandidate::parse(&rendered).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
