// Structured diagnostics with stable error codes
use serde::Serialize;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Diagnostic {
    pub code: &'static str,
    pub title: String,
    pub fields: Vec<(String, String)>,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(code: &'static str, title: String) -> Self {
        Self {
            code,
            title,
            fields: Vec::new(),
            hint: None,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_hint(mut self, hint: String) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Looks up a field value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
