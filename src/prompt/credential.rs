//! git's credential-helper `key=value` protocol, for the `get` action.

use std::collections::BTreeMap;

use crate::prompt::{PromptAnswer, PromptQuery};

/// Attributes git passes to a credential helper on stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialRequest {
    pub attributes: BTreeMap<String, String>,
}

impl CredentialRequest {
    /// Parse `key=value` lines up to the first blank line.
    pub fn parse(input: &str) -> Self {
        let attributes = input
            .lines()
            .take_while(|line| !line.trim().is_empty())
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.to_string()))
            .collect();
        Self { attributes }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// `protocol://[user@]host[/path]`, as far as git told us.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        if let Some(protocol) = self.get("protocol") {
            out.push_str(protocol);
            out.push_str("://");
        }
        if let Some(user) = self.get("username") {
            out.push_str(user);
            out.push('@');
        }
        out.push_str(self.get("host").unwrap_or("remote"));
        if let Some(path) = self.get("path") {
            out.push('/');
            out.push_str(path);
        }
        out
    }

    pub fn to_query(&self, pid: u32) -> PromptQuery {
        PromptQuery {
            prompt: format!("Please enter your credentials for {}", self.describe()),
            include_username: self.get("username").is_none(),
            pid: Some(pid),
        }
    }

    /// Response lines for git. A username git already supplied is kept.
    pub fn format_answer(&self, answer: &PromptAnswer) -> String {
        let mut out = String::new();
        for key in ["protocol", "host", "path"] {
            if let Some(value) = self.get(key) {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        let username = answer.username.as_deref().or_else(|| self.get("username"));
        if let Some(username) = username {
            out.push_str(&format!("username={username}\n"));
        }
        out.push_str(&format!("password={}\n", answer.password));
        out
    }
}
