// Type definitions shared by the wire layer and the engine

use crate::commands::type_tags;
use crate::protocol::{CoordError, CoordResult};
use serde::{Deserialize, Serialize};
use std::fmt;

// Object IDs are 8 bytes in JDWP
pub type ObjectId = u64;
pub type ThreadId = ObjectId;

pub type ReferenceTypeId = u64;
pub type ClassId = ReferenceTypeId;

pub type MethodId = u64;
pub type FrameId = u64;

/// Request id assigned by the controlled process when a request is armed
pub type RequestId = i32;

// Location identifies a code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index (PC)
}

impl Location {
    pub fn new(class_id: ClassId, method_id: MethodId, index: u64) -> Self {
        Self {
            type_tag: type_tags::CLASS,
            class_id,
            method_id,
            index,
        }
    }

    /// Same method, any code index
    pub fn same_method(&self, other: &Location) -> bool {
        self.class_id == other.class_id && self.method_id == other.method_id
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}@{}", self.class_id, self.method_id, self.index)
    }
}

/// How many threads a triggered event freezes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    #[default]
    EventThread = 1,
    All = 2,
}

impl SuspendPolicy {
    pub fn from_u8(value: u8) -> CoordResult<Self> {
        match value {
            0 => Ok(SuspendPolicy::None),
            1 => Ok(SuspendPolicy::EventThread),
            2 => Ok(SuspendPolicy::All),
            other => Err(CoordError::Protocol(format!("Invalid suspend policy: {}", other))),
        }
    }
}

// Stack frame information as reported by the controlled process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

/// Convert a binary class name ("com.example.Foo") to a JNI signature ("Lcom/example/Foo;")
pub fn class_signature(class_name: &str) -> String {
    format!("L{};", class_name.replace('.', "/"))
}

/// Convert a JNI class signature back to a binary class name
pub fn class_name(signature: &str) -> String {
    signature
        .strip_prefix('L')
        .and_then(|s| s.strip_suffix(';'))
        .unwrap_or(signature)
        .replace('/', ".")
}

/// Match a class name against a JDWP-style pattern: exact, "prefix.*" or "*.suffix"
pub fn class_matches(pattern: &str, class_name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        class_name.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        class_name.ends_with(suffix)
    } else {
        pattern == class_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_conversion() {
        assert_eq!(class_signature("com.example.Foo"), "Lcom/example/Foo;");
        assert_eq!(class_name("Lcom/example/Foo;"), "com.example.Foo");
        assert_eq!(class_name("[I"), "[I");
    }

    #[test]
    fn test_class_patterns() {
        assert!(class_matches("com.example.*", "com.example.Foo"));
        assert!(class_matches("*.Foo", "com.example.Foo"));
        assert!(class_matches("com.example.Foo", "com.example.Foo"));
        assert!(!class_matches("com.example.Foo", "com.example.FooBar"));
    }

    #[test]
    fn test_suspend_policy_ordering() {
        assert!(SuspendPolicy::All > SuspendPolicy::EventThread);
        assert!(SuspendPolicy::EventThread > SuspendPolicy::None);
        assert_eq!(SuspendPolicy::from_u8(2).unwrap(), SuspendPolicy::All);
        assert!(SuspendPolicy::from_u8(3).is_err());
    }
}
