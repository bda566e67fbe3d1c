//! Discovery filters for the public profile listing.

use crate::storage::Role;
use serde::Serialize;

/// Cache key prefix shared by every public listing
pub const CACHE_PREFIX: &str = "public-profiles-";

/// Filters for `GET /profiles/public`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expertise: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

impl SearchFilters {
    /// Query parameters in backend order; list filters repeat their key
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if let Some(role) = self.role {
            pairs.push(("role", role.as_str().to_string()));
        }
        if let Some(location) = self.location.as_deref().filter(|l| !l.is_empty()) {
            pairs.push(("location", location.to_string()));
        }
        for e in self.expertise.iter().filter(|e| !e.is_empty()) {
            pairs.push(("expertise", e.clone()));
        }
        for i in self.interests.iter().filter(|i| !i.is_empty()) {
            pairs.push(("interests", i.clone()));
        }
        // Zero means "unset" to the backend as well.
        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset.filter(|o| *o > 0) {
            pairs.push(("offset", offset.to_string()));
        }

        pairs
    }

    /// Deterministic cache key for this filter set
    pub fn fingerprint(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_default();
        format!("{}{}", CACHE_PREFIX, body)
    }

    /// Without an explicit role, list the viewer's counterparts (mentees see mentors)
    pub fn or_counterpart_of(mut self, viewer: Option<Role>) -> Self {
        if self.role.is_none() {
            self.role = viewer.map(|r| r.counterpart());
        }
        self
    }

    /// Parse REPL arguments such as `--expertise Rust --role mentor`
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut filters = Self::default();
        let mut iter = args.iter();

        while let Some(flag) = iter.next() {
            let mut value = || {
                iter.next()
                    .cloned()
                    .ok_or_else(|| format!("Missing value for {}", flag))
            };
            match flag.as_str() {
                "--role" => {
                    let v = value()?;
                    filters.role =
                        Some(Role::from_str(&v).ok_or_else(|| format!("Unknown role: {}", v))?);
                }
                "--location" => filters.location = Some(value()?),
                "--expertise" => filters.expertise.push(value()?),
                "--interest" | "--interests" => filters.interests.push(value()?),
                "--limit" => {
                    let v = value()?;
                    filters.limit = Some(v.parse().map_err(|_| format!("Invalid limit: {}", v))?);
                }
                "--offset" => {
                    let v = value()?;
                    filters.offset =
                        Some(v.parse().map_err(|_| format!("Invalid offset: {}", v))?);
                }
                other => return Err(format!("Unknown filter: {}", other)),
            }
        }

        Ok(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        shell_words::split(s).unwrap()
    }

    #[test]
    fn test_query_pairs_repeat_lists() {
        let filters = SearchFilters {
            role: Some(Role::Mentor),
            location: Some("Berlin".to_string()),
            expertise: vec!["Rust".to_string(), "Go".to_string()],
            interests: vec!["Music".to_string()],
            limit: Some(3),
            offset: None,
        };
        assert_eq!(
            filters.query_pairs(),
            vec![
                ("role", "mentor".to_string()),
                ("location", "Berlin".to_string()),
                ("expertise", "Rust".to_string()),
                ("expertise", "Go".to_string()),
                ("interests", "Music".to_string()),
                ("limit", "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_values_are_omitted() {
        let filters = SearchFilters {
            location: Some(String::new()),
            expertise: vec![String::new()],
            limit: Some(0),
            ..SearchFilters::default()
        };
        assert!(filters.query_pairs().is_empty());
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_distinct() {
        let a = SearchFilters {
            expertise: vec!["Rust".to_string()],
            ..SearchFilters::default()
        };
        let b = a.clone();
        let c = SearchFilters {
            expertise: vec!["Go".to_string()],
            ..SearchFilters::default()
        };

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(a.fingerprint().starts_with(CACHE_PREFIX));
        assert_eq!(SearchFilters::default().fingerprint(), "public-profiles-{}");
    }

    #[test]
    fn test_from_args() {
        let filters =
            SearchFilters::from_args(&args(r#"--role mentee --expertise "Machine Learning" --limit 5"#))
                .unwrap();
        assert_eq!(filters.role, Some(Role::Mentee));
        assert_eq!(filters.expertise, vec!["Machine Learning".to_string()]);
        assert_eq!(filters.limit, Some(5));
    }

    #[test]
    fn test_role_defaults_to_counterpart() {
        let filters = SearchFilters::from_args(&args("--expertise Rust"))
            .unwrap()
            .or_counterpart_of(Some(Role::Mentee));
        assert_eq!(filters.role, Some(Role::Mentor));

        let explicit = SearchFilters::from_args(&args("--role mentee"))
            .unwrap()
            .or_counterpart_of(Some(Role::Mentee));
        assert_eq!(explicit.role, Some(Role::Mentee));

        let anonymous = SearchFilters::default().or_counterpart_of(None);
        assert_eq!(anonymous.role, None);
    }

    #[test]
    fn test_from_args_errors() {
        assert!(SearchFilters::from_args(&args("--role admin")).is_err());
        assert!(SearchFilters::from_args(&args("--limit")).is_err());
        assert!(SearchFilters::from_args(&args("--colour blue")).is_err());
    }
}
