use thiserror::Error;

/// Error types for rule loading and page collection.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// A required argument (url, group, id, rule bytes) was empty.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No rule in the group matched the URL.
    #[error("No rule matched {url} in group '{group}'")]
    NoRuleMatched { group: String, url: String },

    /// A rule declared a different group than the one it was appended to.
    #[error("Rule '{id}' belongs to group '{found}', expected '{expected}'")]
    GroupMismatch {
        id: String,
        expected: String,
        found: String,
    },

    /// Tab creation, subscription or a navigation command failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Rule definition is not valid YAML for the rule schema.
    #[error("Rule parse error: {0}")]
    RuleParse(#[from] serde_yaml::Error),

    /// Rule definition parsed but carries an unusable value.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Reading a rule file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// Returns true if the error was raised before any tab was opened.
    pub fn is_pre_transport(&self) -> bool {
        matches!(
            self,
            HarvestError::InvalidArgument(_) | HarvestError::NoRuleMatched { .. }
        )
    }

    /// Returns true if the error was raised while loading a rule.
    pub fn is_rule_error(&self) -> bool {
        matches!(
            self,
            HarvestError::RuleParse(_)
                | HarvestError::InvalidRule(_)
                | HarvestError::GroupMismatch { .. }
                | HarvestError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_transport_errors() {
        assert!(HarvestError::InvalidArgument("url".into()).is_pre_transport());
        assert!(
            HarvestError::NoRuleMatched {
                group: "default".into(),
                url: "https://example.com".into(),
            }
            .is_pre_transport()
        );
        assert!(!HarvestError::Transport("closed".into()).is_pre_transport());
    }

    #[test]
    fn test_rule_errors() {
        assert!(HarvestError::InvalidRule("bad wait".into()).is_rule_error());
        assert!(
            HarvestError::GroupMismatch {
                id: "jd".into(),
                expected: "default".into(),
                found: "shop".into(),
            }
            .is_rule_error()
        );
        assert!(!HarvestError::Transport("closed".into()).is_rule_error());
    }

    #[test]
    fn test_display_names_the_group() {
        let err = HarvestError::NoRuleMatched {
            group: "shop".into(),
            url: "https://example.com".into(),
        };
        assert_eq!(
            err.to_string(),
            "No rule matched https://example.com in group 'shop'"
        );
    }
}
