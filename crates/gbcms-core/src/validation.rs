use crate::error::ClientError;
use crate::{NewProject, Theme};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const ARCHIVE_EXTENSIONS: [&str; 2] = [".zip", ".tar.gz"];

/// Partial user settings update; absent fields are left alone server side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.email.is_none() && self.theme.is_none()
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.is_empty() {
            return Err(ClientError::Validation("settings update is empty".to_string()));
        }
        if let Some(username) = &self.username {
            if username.trim().is_empty() {
                return Err(ClientError::Validation("username must not be empty".to_string()));
            }
        }
        if let Some(email) = &self.email {
            if !email_pattern().is_match(email.trim()) {
                return Err(ClientError::Validation(format!("invalid email address: {email}")));
            }
        }
        Ok(())
    }
}

/// An uploaded project archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectArchive {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ProjectArchive {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let name = self.file_name.trim().to_lowercase();
        if name.is_empty() {
            return Err(ClientError::Validation("archive file name is empty".to_string()));
        }
        if !ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            return Err(ClientError::Validation(format!(
                "unsupported archive type: {} (expected .zip or .tar.gz)",
                self.file_name
            )));
        }
        if self.bytes.is_empty() {
            return Err(ClientError::Validation("archive is empty".to_string()));
        }
        Ok(())
    }
}

pub fn validate_new_project(project: &NewProject) -> Result<(), ClientError> {
    if project.name.trim().is_empty() {
        return Err(ClientError::Validation("project name must not be empty".to_string()));
    }
    Ok(())
}

pub fn validate_chat_message(text: &str) -> Result<(), ClientError> {
    if text.trim().is_empty() {
        return Err(ClientError::Validation("message must not be empty".to_string()));
    }
    Ok(())
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_project_names() {
        let project = NewProject {
            name: "   ".to_string(),
            description: String::new(),
        };
        assert!(matches!(
            validate_new_project(&project),
            Err(ClientError::Validation(_))
        ));
    }

    #[test]
    fn rejects_blank_chat_messages() {
        assert!(validate_chat_message("").is_err());
        assert!(validate_chat_message("\n\t").is_err());
        assert!(validate_chat_message("hi").is_ok());
    }

    #[test]
    fn settings_update_requires_a_field_and_valid_email() {
        assert!(SettingsUpdate::default().validate().is_err());

        let bad_email = SettingsUpdate {
            email: Some("not-an-email".to_string()),
            ..SettingsUpdate::default()
        };
        assert!(bad_email.validate().is_err());

        let theme_only = SettingsUpdate {
            theme: Some(Theme::VsDark),
            ..SettingsUpdate::default()
        };
        assert!(theme_only.validate().is_ok());
        let json = serde_json::to_string(&theme_only).expect("serialize");
        assert_eq!(json, r#"{"theme":"vs-dark"}"#);
    }

    #[test]
    fn archive_requires_known_extension_and_content() {
        assert!(ProjectArchive::new("repo.zip", vec![1]).validate().is_ok());
        assert!(ProjectArchive::new("Repo.TAR.GZ", vec![1]).validate().is_ok());
        assert!(ProjectArchive::new("repo.rar", vec![1]).validate().is_err());
        assert!(ProjectArchive::new("repo.zip", Vec::new()).validate().is_err());
    }
}
