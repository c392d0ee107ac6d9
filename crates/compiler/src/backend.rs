//! Collaborator seams: the code-generation backend and the C-header
//! importer.
//!
//! The front end finishes with a fully typed, monomorphized
//! [`TranslationUnit`]; everything below that line is a collaborator
//! plugged in through these traits. The bundled [`NullBackend`] keeps the
//! driver honest when no real backend is linked.

use crate::ast::TranslationUnit;
use crate::diagnostics::Diagnostics;
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything a backend needs beyond the declarations themselves.
#[derive(Debug, Clone, Default)]
pub struct BackendContext {
    /// `Owner::method` → mangled function name.
    pub method_registry: HashMap<String, String>,
    /// Arena regions with their declared capacities.
    pub regions: Vec<RegionDescriptor>,
    /// Emit textual IR instead of bitcode.
    pub emit_text: bool,
}

#[derive(Debug, Clone)]
pub struct RegionDescriptor {
    pub name: String,
    pub capacity: Option<u64>,
}

/// A code generator consuming the finished unit.
///
/// The unit it receives upholds the front end's contract: every
/// expression is typed, `typeof` is folded, `if const` carries its
/// resolved branch, subscripts carry `bounds_check_omit`, binaries carry
/// `resolved_operator`, calls carry `method_base`, and monomorphized
/// clones are appended with mangled names. Declarations that still carry
/// generic parameters are templates and must be skipped.
pub trait Backend {
    /// Lower the unit. Codegen problems are reported through the
    /// diagnostics sink; `Err` is for infrastructure failure.
    fn emit(
        &mut self,
        unit: &TranslationUnit,
        context: &BackendContext,
        diags: &mut Diagnostics,
    ) -> Result<Vec<u8>, String>;
}

/// Supplies SafeC-compatible extern declarations for a C header the
/// preprocessor could not resolve on disk (typedefs first, then
/// functions). The returned text is consumed as ordinary source.
pub trait HeaderImporter {
    fn import(&self, header: &str, include_paths: &[PathBuf]) -> Option<String>;
}

/// The backend used when none is linked: accepts nothing, so builds that
/// ask for output fail loudly instead of succeeding silently.
#[derive(Debug, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn emit(
        &mut self,
        _unit: &TranslationUnit,
        _context: &BackendContext,
        _diags: &mut Diagnostics,
    ) -> Result<Vec<u8>, String> {
        Err("no code-generation backend is linked into this build".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_backend_refuses() {
        let mut diags = Diagnostics::silent();
        let unit = TranslationUnit::new();
        let result = NullBackend.emit(&unit, &BackendContext::default(), &mut diags);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("no code-generation backend"));
    }

    struct FixedImporter;

    impl HeaderImporter for FixedImporter {
        fn import(&self, header: &str, _include_paths: &[PathBuf]) -> Option<String> {
            (header == "host.h").then(|| "extern int host_call(int x);\n".to_string())
        }
    }

    #[test]
    fn test_header_importer_contract() {
        let importer = FixedImporter;
        assert!(importer.import("host.h", &[]).is_some());
        assert!(importer.import("missing.h", &[]).is_none());
    }
}
