//! Profile model plus the small scoring helpers used by the dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of fields that count towards profile completion
const COMPLETION_FIELDS: u32 = 6;

const EXPERTISE_MATCH_POINTS: u32 = 25;
const INTEREST_MATCH_POINTS: u32 = 20;
const LOCATION_MATCH_POINTS: u32 = 15;

/// How many recommendations the dashboard shows
pub const RECOMMENDATION_COUNT: usize = 3;

/// A mentor or mentee profile as served by the backend
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default, deserialize_with = "nullable_list")]
    pub expertise: Vec<String>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub interests: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The backend stores tag lists as JSON and may send `null` for an empty one
fn nullable_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Profile {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            "(unnamed)".to_string()
        } else {
            name.to_string()
        }
    }
}

/// Payload for `POST /profiles`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CreateProfileRequest {
    pub first_name: String,
    pub last_name: String,
    pub bio: String,
    pub avatar_url: String,
    pub expertise: Vec<String>,
    pub interests: Vec<String>,
    pub location: String,
}

impl CreateProfileRequest {
    /// Names are required by the backend; check before sending
    pub fn validate(&self) -> Result<(), String> {
        if self.first_name.trim().is_empty() {
            return Err("First name is required".to_string());
        }
        if self.last_name.trim().is_empty() {
            return Err("Last name is required".to_string());
        }
        Ok(())
    }
}

/// Payload for `PUT /profiles`; unset fields are left unchanged
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct UpdateProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expertise: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interests: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl UpdateProfileRequest {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Percentage of the six profile fields that are filled in
pub fn completion_percent(profile: Option<&Profile>) -> u32 {
    let Some(p) = profile else {
        return 0;
    };

    let filled = [
        !p.first_name.is_empty(),
        !p.last_name.is_empty(),
        !p.bio.is_empty(),
        !p.location.is_empty(),
        !p.expertise.is_empty(),
        !p.interests.is_empty(),
    ]
    .iter()
    .filter(|f| **f)
    .count() as u32;

    (f64::from(filled) / f64::from(COMPLETION_FIELDS) * 100.0).round() as u32
}

/// Heuristic affinity between the viewer and another profile
pub fn match_score(me: &Profile, other: &Profile) -> u32 {
    let expertise_hits = other
        .expertise
        .iter()
        .filter(|e| me.interests.contains(e))
        .count() as u32;
    let interest_hits = other
        .interests
        .iter()
        .filter(|i| me.interests.contains(i))
        .count() as u32;

    let mut score = expertise_hits * EXPERTISE_MATCH_POINTS + interest_hits * INTEREST_MATCH_POINTS;
    if !me.location.is_empty() && other.location == me.location {
        score += LOCATION_MATCH_POINTS;
    }
    score
}

/// A candidate with its score
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub profile: Profile,
    pub score: u32,
}

/// Best `limit` candidates for `me`, highest score first, excluding `me` itself
pub fn recommend(me: &Profile, candidates: Vec<Profile>, limit: usize) -> Vec<Recommendation> {
    let mut scored: Vec<Recommendation> = candidates
        .into_iter()
        .filter(|c| c.id != me.id)
        .map(|profile| Recommendation {
            score: match_score(me, &profile),
            profile,
        })
        .collect();
    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored.truncate(limit);
    scored
}

/// Split a comma separated tag list, dropping blanks and duplicates
pub fn parse_tags(input: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, expertise: &[&str], interests: &[&str], location: &str) -> Profile {
        Profile {
            id: id.to_string(),
            expertise: expertise.iter().map(|s| s.to_string()).collect(),
            interests: interests.iter().map(|s| s.to_string()).collect(),
            location: location.to_string(),
            ..Profile::default()
        }
    }

    #[test]
    fn test_completion_percent() {
        assert_eq!(completion_percent(None), 0);

        let mut p = Profile::default();
        assert_eq!(completion_percent(Some(&p)), 0);

        p.first_name = "Ada".to_string();
        p.last_name = "Lovelace".to_string();
        assert_eq!(completion_percent(Some(&p)), 33);

        p.bio = "Engines".to_string();
        p.location = "London".to_string();
        assert_eq!(completion_percent(Some(&p)), 67);

        p.expertise = vec!["Math".to_string()];
        p.interests = vec!["Poetry".to_string()];
        assert_eq!(completion_percent(Some(&p)), 100);
    }

    #[test]
    fn test_match_score() {
        let me = profile("me", &[], &["Rust", "Go"], "Berlin");
        let other = profile("m1", &["Rust", "Go", "C"], &["Go"], "Berlin");
        // two expertise hits, one interest hit, same city
        assert_eq!(match_score(&me, &other), 2 * 25 + 20 + 15);

        let remote = profile("m2", &["C"], &[], "Paris");
        assert_eq!(match_score(&me, &remote), 0);
    }

    #[test]
    fn test_empty_location_never_matches() {
        let me = profile("me", &[], &[], "");
        let other = profile("m1", &[], &[], "");
        assert_eq!(match_score(&me, &other), 0);
    }

    #[test]
    fn test_recommend_excludes_self_and_sorts() {
        let me = profile("me", &[], &["Rust"], "Oslo");
        let candidates = vec![
            profile("me", &["Rust"], &["Rust"], "Oslo"),
            profile("low", &[], &[], "Rome"),
            profile("high", &["Rust"], &["Rust"], "Oslo"),
            profile("mid", &["Rust"], &[], "Rome"),
            profile("local", &[], &[], "Oslo"),
        ];

        let recs = recommend(&me, candidates, RECOMMENDATION_COUNT);
        let ids: Vec<&str> = recs.iter().map(|r| r.profile.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "local"]);
        assert_eq!(recs[0].score, 60);
    }

    #[test]
    fn test_profile_accepts_null_lists() {
        let json = r#"{"id":"p1","user_id":"u1","first_name":"Ada","expertise":null,"interests":["Math"]}"#;
        let p: Profile = serde_json::from_str(json).unwrap();
        assert!(p.expertise.is_empty());
        assert_eq!(p.interests, vec!["Math".to_string()]);
        assert_eq!(p.display_name(), "Ada");
    }

    #[test]
    fn test_update_request_serializes_only_set_fields() {
        let update = UpdateProfileRequest {
            bio: Some("New bio".to_string()),
            ..UpdateProfileRequest::default()
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({ "bio": "New bio" })
        );
        assert!(UpdateProfileRequest::default().is_empty());
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(
            parse_tags(" Rust, Go ,, Rust "),
            vec!["Rust".to_string(), "Go".to_string()]
        );
        assert!(parse_tags("").is_empty());
    }

    #[test]
    fn test_create_request_requires_names() {
        let mut req = CreateProfileRequest::default();
        assert!(req.validate().is_err());
        req.first_name = "Ada".to_string();
        assert_eq!(req.validate().unwrap_err(), "Last name is required");
        req.last_name = "Lovelace".to_string();
        assert!(req.validate().is_ok());
    }
}
