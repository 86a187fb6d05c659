//! Pragma/config table (spec §6), generalized from the teacher's
//! `CompilerConfig` builder (`config.rs`) from a runtime-extension registry
//! into the compiler's own boolean/enum/integer pragma set.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renderer {
    Sds1,
    Sds2,
}

impl Default for Renderer {
    fn default() -> Self {
        Renderer::Sds1
    }
}

impl std::str::FromStr for Renderer {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sds1" => Ok(Renderer::Sds1),
            "sds2" => Ok(Renderer::Sds2),
            other => Err(format!("unknown renderer `{}` (expected sds1 or sds2)", other)),
        }
    }
}

/// Compiler-wide configuration, built first from `#pragma` directives seen
/// while preprocessing and then overridden by CLI `--pragma` flags.
#[derive(Debug, Clone)]
pub struct PragmaSet {
    pub renderer: Renderer,
    pub inline_one_use_functions: bool,
    pub push_pop_trampolines: bool,
    pub safe_stack: bool,
    pub stack_start: i64,
    pub stack_end: i64,
    pub comments: bool,
    pub header: bool,
    pub indent: String,
    pub keep_names: bool,
    pub simplify_ifs: bool,
    pub builtin_logging: bool,
    pub builtin_error_logging: bool,
    pub fullspeed: bool,
}

impl Default for PragmaSet {
    fn default() -> Self {
        PragmaSet {
            renderer: Renderer::Sds1,
            inline_one_use_functions: false,
            push_pop_trampolines: false,
            safe_stack: true,
            stack_start: 300,
            stack_end: 511,
            comments: false,
            header: false,
            indent: "  ".to_string(),
            keep_names: false,
            simplify_ifs: false,
            builtin_logging: false,
            builtin_error_logging: false,
            fullspeed: false,
        }
    }
}

impl PragmaSet {
    pub fn new() -> Self {
        PragmaSet::default()
    }

    /// Applies one `#pragma name value` or `--pragma name=value` setting.
    /// Unknown names and malformed values are returned as `Err` so the
    /// caller can turn them into a warning (unknown pragma) rather than a
    /// hard error, per spec §7.
    pub fn apply(&mut self, name: &str, value: Option<&str>) -> Result<(), String> {
        let as_bool = |v: Option<&str>| -> Result<bool, String> {
            match v {
                Some("true") | None => Ok(true),
                Some("false") => Ok(false),
                Some(other) => Err(format!("expected true/false, got `{}`", other)),
            }
        };
        let as_int = |v: Option<&str>| -> Result<i64, String> {
            v.ok_or_else(|| "expected an integer value".to_string())?
                .parse::<i64>()
                .map_err(|_| format!("expected an integer value, got `{}`", v.unwrap()))
        };

        match name {
            "renderer" => {
                self.renderer = value
                    .ok_or_else(|| "expected sds1 or sds2".to_string())?
                    .parse()?;
            }
            "once" => { /* handled by the include stack, not stored here */ }
            "inline_one_use_functions" => self.inline_one_use_functions = as_bool(value)?,
            "push_pop_trampolines" => self.push_pop_trampolines = as_bool(value)?,
            "safe_stack" => self.safe_stack = as_bool(value)?,
            "stack_start" => self.stack_start = as_int(value)?,
            "stack_end" => self.stack_end = as_int(value)?,
            "comments" => self.comments = as_bool(value)?,
            "header" => self.header = as_bool(value)?,
            "indent" => self.indent = value.ok_or("expected a string value")?.to_string(),
            "keep_names" => self.keep_names = as_bool(value)?,
            "simplify_ifs" => self.simplify_ifs = as_bool(value)?,
            "builtin_logging" => self.builtin_logging = as_bool(value)?,
            "builtin_error_logging" => self.builtin_error_logging = as_bool(value)?,
            "fullspeed" => self.fullspeed = as_bool(value)?,
            other => return Err(format!("unknown pragma `{}`", other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let p = PragmaSet::default();
        assert_eq!(p.renderer, Renderer::Sds1);
        assert!(!p.inline_one_use_functions);
        assert!(!p.push_pop_trampolines);
        assert!(p.safe_stack);
        assert_eq!(p.stack_start, 300);
        assert_eq!(p.stack_end, 511);
    }

    #[test]
    fn apply_boolean_pragma() {
        let mut p = PragmaSet::new();
        p.apply("safe_stack", Some("false")).unwrap();
        assert!(!p.safe_stack);
        p.apply("push_pop_trampolines", None).unwrap();
        assert!(p.push_pop_trampolines);
    }

    #[test]
    fn apply_renderer_pragma() {
        let mut p = PragmaSet::new();
        p.apply("renderer", Some("sds2")).unwrap();
        assert_eq!(p.renderer, Renderer::Sds2);
    }

    #[test]
    fn apply_integer_pragma() {
        let mut p = PragmaSet::new();
        p.apply("stack_start", Some("100")).unwrap();
        assert_eq!(p.stack_start, 100);
    }

    #[test]
    fn unknown_pragma_is_an_error_the_caller_can_downgrade_to_a_warning() {
        let mut p = PragmaSet::new();
        assert!(p.apply("not_a_real_pragma", Some("1")).is_err());
    }
}
