//! The hosted C standard library surface.
//!
//! `--freestanding` builds target environments with no libc; the analyzer
//! warns when a program calls into this table. The table is data, not
//! code: an embedded TOML file, replaceable through [`StdlibSurface::from_toml`]
//! by tooling that knows a different runtime.

use serde::Deserialize;
use std::collections::HashSet;

/// Embedded default table.
pub static DEFAULT_SURFACE: &str = include_str!("stdlib_surface.toml");

#[derive(Debug, Clone, Deserialize)]
struct Group {
    header: String,
    functions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SurfaceFile {
    #[serde(rename = "group")]
    groups: Vec<Group>,
}

#[derive(Debug, Clone)]
pub struct StdlibSurface {
    functions: HashSet<String>,
    headers: Vec<String>,
}

impl StdlibSurface {
    /// Parse a surface table from TOML text.
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        let file: SurfaceFile = toml::from_str(toml_str)
            .map_err(|e| format!("failed to parse stdlib surface table: {}", e))?;
        let mut functions = HashSet::new();
        let mut headers = Vec::new();
        for group in file.groups {
            headers.push(group.header);
            functions.extend(group.functions);
        }
        Ok(StdlibSurface { functions, headers })
    }

    /// The embedded default table. The embedded file is validated by the
    /// test suite, so this cannot fail at runtime.
    pub fn embedded() -> Self {
        Self::from_toml(DEFAULT_SURFACE).expect("embedded stdlib surface table is well-formed")
    }

    pub fn contains(&self, function: &str) -> bool {
        self.functions.contains(function)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_table_parses() {
        let surface = StdlibSurface::embedded();
        assert!(!surface.is_empty());
        assert!(surface.headers().len() >= 4);
    }

    #[test]
    fn test_common_functions_present() {
        let surface = StdlibSurface::embedded();
        for f in ["printf", "malloc", "memcpy", "sqrt", "free", "strlen"] {
            assert!(surface.contains(f), "{} should be in the table", f);
        }
        assert!(!surface.contains("my_own_function"));
    }

    #[test]
    fn test_custom_table() {
        let surface = StdlibSurface::from_toml(
            r#"
[[group]]
header = "myrt.h"
functions = ["rt_send", "rt_recv"]
"#,
        )
        .unwrap();
        assert!(surface.contains("rt_send"));
        assert!(!surface.contains("printf"));
        assert_eq!(surface.len(), 2);
    }

    #[test]
    fn test_malformed_table_rejected() {
        assert!(StdlibSurface::from_toml("group = 3").is_err());
    }
}
