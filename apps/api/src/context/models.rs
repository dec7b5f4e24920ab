use serde::{Deserialize, Serialize};

/// Profile fields supplied by the caller with every request. The core never stores them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub full_name: Option<String>,
    pub skills: Vec<String>,
    pub experiences: Vec<String>,
    pub projects: Vec<String>,
    /// The job description the user is currently targeting.
    pub jd_text: Option<String>,
}

impl Profile {
    pub fn full_name(&self) -> Option<&str> {
        non_blank(self.full_name.as_deref())
    }

    pub fn jd_text(&self) -> Option<&str> {
        non_blank(self.jd_text.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.full_name().is_none()
            && self.jd_text().is_none()
            && present(&self.skills).is_empty()
            && present(&self.experiences).is_empty()
            && present(&self.projects).is_empty()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// The non-blank, trimmed entries of a profile list.
pub fn present(items: &[String]) -> Vec<&str> {
    items
        .iter()
        .map(|i| i.trim())
        .filter(|i| !i.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_deserialize_to_defaults() {
        let profile: Profile = serde_json::from_str(r#"{"skills": ["Rust"]}"#).unwrap();
        assert_eq!(profile.skills, vec!["Rust"]);
        assert!(profile.full_name.is_none());
        assert!(profile.experiences.is_empty());
    }

    #[test]
    fn test_blank_fields_count_as_absent() {
        let profile = Profile {
            full_name: Some("   ".to_string()),
            skills: vec![" ".to_string()],
            jd_text: Some(String::new()),
            ..Default::default()
        };
        assert!(profile.full_name().is_none());
        assert!(profile.is_empty());
    }
}
