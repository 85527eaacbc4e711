//! Operational-transform style edits to text files.
//!
//! An operation is a sequence of retain / insert / remove components that
//! together consume the whole base string. On the wire it is a JSON array
//! where a positive integer retains, a string inserts and a negative integer
//! removes. Lengths are counted in characters; supplementary-plane
//! characters are not allowed in insertions.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Upper bound on the length of any text file.
pub const MAX_STRING_LENGTH: usize = 2 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Component {
    Retain(usize),
    Insert(String),
    Remove(usize),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RawComponent>", into = "Vec<RawComponent>")]
pub struct TextOperation {
    components: Vec<Component>,
    base_length: usize,
    target_length: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawComponent {
    Count(i64),
    Text(String),
}

impl TextOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(mut self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        self.base_length += n;
        self.target_length += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    pub fn insert(mut self, text: &str) -> Self {
        if text.is_empty() {
            return self;
        }
        self.target_length += text.chars().count();
        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
        } else {
            self.components.push(Component::Insert(text.to_string()));
        }
        self
    }

    pub fn remove(mut self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        self.base_length += n;
        if let Some(Component::Remove(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Remove(n));
        }
        self
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn base_length(&self) -> usize {
        self.base_length
    }

    pub fn target_length(&self) -> usize {
        self.target_length
    }

    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Apply to a string, producing the edited string.
    pub fn apply(&self, input: &str) -> Result<String> {
        let chars: Vec<char> = input.chars().collect();
        if chars.len() != self.base_length {
            return Err(StoreError::InvalidChange(format!(
                "operation base length {} does not match string length {}",
                self.base_length,
                chars.len()
            )));
        }

        let mut out = String::with_capacity(input.len());
        let mut pos = 0usize;
        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    if pos + n > chars.len() {
                        return Err(StoreError::InvalidChange(
                            "operation cannot retain more characters than are left".into(),
                        ));
                    }
                    out.extend(&chars[pos..pos + n]);
                    pos += n;
                }
                Component::Insert(text) => {
                    check_insertion(text)?;
                    out.push_str(text);
                }
                Component::Remove(n) => {
                    if pos + n > chars.len() {
                        return Err(StoreError::InvalidChange(
                            "operation cannot remove more characters than are left".into(),
                        ));
                    }
                    pos += n;
                }
            }
        }
        if pos != chars.len() {
            return Err(StoreError::InvalidChange(
                "operation did not consume the whole string".into(),
            ));
        }
        if self.target_length > MAX_STRING_LENGTH {
            return Err(StoreError::InvalidChange(format!(
                "resulting string length {} exceeds maximum",
                self.target_length
            )));
        }
        Ok(out)
    }

    /// Apply to a string of the given length without its content.
    pub fn apply_to_length(&self, length: usize) -> Result<usize> {
        if length != self.base_length {
            return Err(StoreError::InvalidChange(format!(
                "operation base length {} does not match string length {length}",
                self.base_length
            )));
        }
        for component in &self.components {
            if let Component::Insert(text) = component {
                check_insertion(text)?;
            }
        }
        if self.target_length > MAX_STRING_LENGTH {
            return Err(StoreError::InvalidChange(format!(
                "resulting string length {} exceeds maximum",
                self.target_length
            )));
        }
        Ok(self.target_length)
    }
}

fn check_insertion(text: &str) -> Result<()> {
    if text.chars().any(|c| (c as u32) > 0xFFFF) {
        return Err(StoreError::InvalidChange(
            "insertion contains characters outside the basic multilingual plane".into(),
        ));
    }
    Ok(())
}

impl TryFrom<Vec<RawComponent>> for TextOperation {
    type Error = StoreError;

    fn try_from(raw: Vec<RawComponent>) -> Result<Self> {
        let mut op = TextOperation::new();
        for component in raw {
            op = match component {
                RawComponent::Count(n) if n > 0 => op.retain(n as usize),
                RawComponent::Count(n) if n < 0 => op.remove(n.unsigned_abs() as usize),
                RawComponent::Count(_) => {
                    return Err(StoreError::InvalidFormat("zero-length text operation component".into()))
                }
                RawComponent::Text(text) => op.insert(&text),
            };
        }
        Ok(op)
    }
}

impl From<TextOperation> for Vec<RawComponent> {
    fn from(op: TextOperation) -> Self {
        op.components
            .into_iter()
            .map(|c| match c {
                Component::Retain(n) => RawComponent::Count(n as i64),
                Component::Insert(text) => RawComponent::Text(text),
                Component::Remove(n) => RawComponent::Count(-(n as i64)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply() {
        let op = TextOperation::new().retain(6).remove(5).insert("there");
        assert_eq!(op.apply("hello world").unwrap(), "hello there");
        assert_eq!(op.apply_to_length(11).unwrap(), 11);
    }

    #[test]
    fn test_base_length_mismatch() {
        let op = TextOperation::new().retain(3);
        assert!(op.apply("ab").unwrap_err().is_invalid_change());
        assert!(op.apply_to_length(4).is_err());
    }

    #[test]
    fn test_rejects_astral_insert() {
        let op = TextOperation::new().insert("\u{1F600}");
        assert!(op.apply("").is_err());
        assert!(op.apply_to_length(0).is_err());
    }

    #[test]
    fn test_counts_characters() {
        let op = TextOperation::new().retain(2).insert("é");
        assert_eq!(op.apply("ßü").unwrap(), "ßüé");
    }

    #[test]
    fn test_wire_format() {
        let op: TextOperation = serde_json::from_str(r#"[3, "abc", -2, 1]"#).unwrap();
        assert_eq!(op.base_length(), 6);
        assert_eq!(op.target_length(), 7);
        assert_eq!(serde_json::to_string(&op).unwrap(), r#"[3,"abc",-2,1]"#);
        assert!(serde_json::from_str::<TextOperation>("[0]").is_err());
    }
}
