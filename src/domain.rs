use crate::error::InputError;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Normalized target domain plus the two-stage name predicate.
///
/// Stage one is a broad substring test, the same test an indexed ledger can
/// run cheaply and which admits false positives such as `xbar.example.com`
/// for `bar.example.com`. Stage two keeps only names equal to the domain or
/// ending in `.` + domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMatcher {
    domain: String,
    dotted_suffix: String,
}

impl DomainMatcher {
    pub fn new(input: &str) -> Result<Self, InputError> {
        let domain = normalize_domain(input)?;
        let dotted_suffix = format!(".{}", domain);
        Ok(Self {
            domain,
            dotted_suffix,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Broad pre-filter. Case-insensitive substring test.
    pub fn prefilter(&self, name: &str) -> bool {
        name.to_ascii_lowercase().contains(&self.domain)
    }

    /// Exact suffix check on a label boundary.
    pub fn suffix_matches(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        name == self.domain || name.ends_with(&self.dotted_suffix)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.prefilter(name) && self.suffix_matches(name)
    }

    pub fn matches_any<'a, I>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().any(|n| self.matches(n))
    }
}

/// Validate and normalize a registrable domain or wildcard-style suffix.
///
/// A leading `*.` and a trailing `.` are stripped; the result is lower-cased.
pub fn normalize_domain(input: &str) -> Result<String, InputError> {
    let trimmed = input.trim();
    let stripped = trimmed
        .strip_prefix("*.")
        .or_else(|| trimmed.strip_prefix('.'))
        .unwrap_or(trimmed);
    let domain = stripped.trim_end_matches('.').to_ascii_lowercase();

    if domain.is_empty() {
        return Err(InputError::EmptyDomain);
    }

    let malformed = |reason| InputError::MalformedDomain {
        domain: input.to_string(),
        reason,
    };

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(malformed("longer than 253 characters"));
    }
    if let Some(c) = domain
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')))
    {
        return Err(malformed(if c == '*' {
            "wildcard only allowed as a leading \"*.\""
        } else {
            "invalid character"
        }));
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(malformed("empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(malformed("label longer than 63 characters"));
        }
    }

    Ok(domain)
}

/// Escape `\`, `'`, `%` and `_` for embedding in a SQL LIKE pattern literal.
pub(crate) fn escape_like_pattern(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('\'', "''")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
