use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The analysed cause of a crash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reason {
    pub component: String,
    /// Signal name or exception code, e.g. `SIGSEGV` or `c0000005`.
    pub code: String,
    /// Canonicalised call stack frames, innermost first.
    pub stack: Vec<String>,
}

impl Reason {
    pub fn new(component: impl Into<String>, code: impl Into<String>, stack: Vec<String>) -> Self {
        Self {
            component: component.into(),
            code: code.into(),
            stack,
        }
    }

    /// The stable identifier of this crash.
    ///
    /// Reports with equal reasons always share the identifier. Any change to the hashed
    /// representation invalidates identifiers stored in existing records.
    pub fn crash_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.component.as_bytes());
        hasher.update(b"\n\n");
        hasher.update(self.code.as_bytes());
        hasher.update(b"\n\n");
        hasher.update(self.stack.join("\n").as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} crashed with {}", self.component, self.code)?;
        if let Some(frame) = self.stack.first() {
            write!(f, " at {frame}")?;
        }
        Ok(())
    }
}
