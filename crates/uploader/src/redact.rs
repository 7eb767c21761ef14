//! Scrubbing of identifiers from log messages.
//!
//! Persistence errors carry paths and ids; these are replaced with fixed
//! placeholders before they reach the log.

const JOB: &str = "<job>";
const CREDENTIAL: &str = "<credential>";
const ACCOUNT: &str = "<account>";

/// Replaces known identifiers in a message with placeholders.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    replacements: Vec<(String, &'static str)>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(self, id: &str) -> Self {
        self.with(id, JOB)
    }

    pub fn credential(self, id: &str) -> Self {
        self.with(id, CREDENTIAL)
    }

    /// Scrubs both the account id and its hashed workspace directory name.
    pub fn account(self, id: &str, dir_name: &str) -> Self {
        self.with(id, ACCOUNT).with(dir_name, ACCOUNT)
    }

    fn with(mut self, secret: &str, placeholder: &'static str) -> Self {
        if !secret.is_empty() {
            self.replacements.push((secret.to_string(), placeholder));
        }
        self
    }

    /// Returns `message` with every known identifier replaced.
    pub fn redact(&self, message: &str) -> String {
        // Longest first, so an id containing another id is fully scrubbed.
        let mut ordered: Vec<&(String, &'static str)> = self.replacements.iter().collect();
        ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        ordered
            .into_iter()
            .fold(message.to_string(), |acc, (secret, placeholder)| {
                acc.replace(secret.as_str(), placeholder)
            })
    }
}
