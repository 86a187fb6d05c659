//! Builtin name/arity table (spec §6), narrowed from the teacher's
//! `builtins.rs` stack-effect signature map (this language has no type
//! system) down to a name → fixed-arity table consulted by the semantic
//! pass (to exclude builtins from the user call graph) and the renderer
//! (to pass calls through verbatim).

/// `None` arity means variable argument count (`echo`, `sprintf`).
pub struct Builtin {
    pub name: &'static str,
    pub arity: Option<usize>,
}

const BUILTINS: &[Builtin] = &[
    Builtin { name: "echo", arity: None },
    Builtin { name: "echoinline", arity: None },
    Builtin { name: "wait", arity: Some(1) },
    Builtin { name: "http_get", arity: None },
    Builtin { name: "read_dataflash", arity: Some(2) },
    Builtin { name: "write_ram_block_to_dataflash_page", arity: Some(3) },
    Builtin { name: "read_dataflash_page_to_ram", arity: Some(3) },
    Builtin { name: "sprintf", arity: None },
    Builtin { name: "atoi", arity: Some(1) },
];

pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

pub fn is_builtin(name: &str) -> bool {
    lookup(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_builtins_recognized() {
        assert!(is_builtin("echo"));
        assert!(is_builtin("wait"));
        assert!(!is_builtin("sum"));
    }

    #[test]
    fn fixed_arity_builtin_reports_its_count() {
        assert_eq!(lookup("wait").unwrap().arity, Some(1));
        assert_eq!(lookup("echo").unwrap().arity, None);
    }
}
