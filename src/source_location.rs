use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in the analyzed program's source. Attached to every pattern,
/// loop, hotspot, and recommendation so results stay actionable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: String,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column: 0,
            function: String::new(),
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    pub fn with_column(mut self, column: u32) -> Self {
        self.column = column;
        self
    }

    /// Placeholder location for samples whose instruction pointer could not
    /// be resolved to a source line.
    pub fn unresolved(ip: u64) -> Self {
        Self {
            file: "<unresolved>".to_string(),
            line: 0,
            column: 0,
            function: format!("ip_0x{:x}", ip),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.file != "<unresolved>" && !self.file.is_empty()
    }

    /// Total order used for deterministic output: file, then line, then column.
    pub fn sort_key(&self) -> (&str, u32, u32) {
        (&self.file, self.line, self.column)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.function.is_empty() {
            write!(f, "{}:{}", self.file, self.line)
        } else {
            write!(f, "{}:{} ({})", self.file, self.line, self.function)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let loc = SourceLocation::new("matrix.c", 42).with_function("multiply");
        assert_eq!(loc.to_string(), "matrix.c:42 (multiply)");

        let loc = SourceLocation::new("main.c", 7);
        assert_eq!(loc.to_string(), "main.c:7");
    }

    #[test]
    fn test_unresolved() {
        let loc = SourceLocation::unresolved(0xdeadbeef);
        assert!(!loc.is_resolved());
        assert_eq!(loc.function, "ip_0xdeadbeef");
    }

    #[test]
    fn test_sort_key_orders_by_file_then_line() {
        let a = SourceLocation::new("a.c", 100);
        let b = SourceLocation::new("b.c", 1);
        assert!(a.sort_key() < b.sort_key());

        let c = SourceLocation::new("a.c", 5);
        assert!(c.sort_key() < a.sort_key());
    }
}
