//! Language dispatch: entry-file selection and build/run command templates.
//!
//! Pure and stateless; safe to call from any number of concurrent pipelines.
//! Command templates are argv vectors executed with the sandbox workspace as
//! the working directory.

use crate::error::SandboxError;
use crate::types::SourceFile;

/// Resolved plan for one run: which file is the entry point, the optional
/// build step, the run step, and extra environment for both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub entry_file: String,
    /// Present for compiled languages. A non-zero build exit short-circuits
    /// the run.
    pub build: Option<Vec<String>>,
    pub run: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Python,
    Node,
    Ruby,
    Shell,
    Rust,
    C,
    Cpp,
    Go,
    Java,
}

struct LanguageSpec {
    family: Family,
    /// Canonical entry filenames, in preference order.
    canonical: &'static [&'static str],
    /// Known file extensions (without the dot).
    extensions: &'static [&'static str],
}

const PYTHON: LanguageSpec = LanguageSpec {
    family: Family::Python,
    canonical: &["main.py", "app.py"],
    extensions: &["py"],
};
const NODE: LanguageSpec = LanguageSpec {
    family: Family::Node,
    canonical: &["index.js", "main.js"],
    extensions: &["js", "mjs"],
};
const RUBY: LanguageSpec = LanguageSpec {
    family: Family::Ruby,
    canonical: &["main.rb"],
    extensions: &["rb"],
};
const SHELL: LanguageSpec = LanguageSpec {
    family: Family::Shell,
    canonical: &["main.sh", "run.sh"],
    extensions: &["sh"],
};
const RUST: LanguageSpec = LanguageSpec {
    family: Family::Rust,
    canonical: &["main.rs"],
    extensions: &["rs"],
};
const C: LanguageSpec = LanguageSpec {
    family: Family::C,
    canonical: &["main.c"],
    extensions: &["c"],
};
const CPP: LanguageSpec = LanguageSpec {
    family: Family::Cpp,
    canonical: &["main.cpp", "main.cc"],
    extensions: &["cpp", "cc", "cxx"],
};
const GO: LanguageSpec = LanguageSpec {
    family: Family::Go,
    canonical: &["main.go"],
    extensions: &["go"],
};
const JAVA: LanguageSpec = LanguageSpec {
    family: Family::Java,
    canonical: &["Main.java"],
    extensions: &["java"],
};

fn spec_for(language: &str) -> Option<&'static LanguageSpec> {
    match language.to_ascii_lowercase().as_str() {
        "python" | "python3" | "py" => Some(&PYTHON),
        "javascript" | "js" | "node" | "nodejs" => Some(&NODE),
        "ruby" | "rb" => Some(&RUBY),
        "shell" | "sh" | "bash" => Some(&SHELL),
        "rust" | "rs" => Some(&RUST),
        "c" => Some(&C),
        "cpp" | "c++" | "cxx" => Some(&CPP),
        "go" | "golang" => Some(&GO),
        "java" => Some(&JAVA),
        _ => None,
    }
}

/// Language tags accepted by [`resolve`], one canonical name per family.
pub const fn supported_languages() -> &'static [&'static str] {
    &[
        "python",
        "javascript",
        "ruby",
        "shell",
        "rust",
        "c",
        "cpp",
        "go",
        "java",
    ]
}

/// Resolve a language tag and file set into a [`CommandPlan`].
///
/// Entry-file selection: exact canonical filename first, then the first file
/// with a known extension, in request order.
pub fn resolve(language: &str, files: &[SourceFile]) -> Result<CommandPlan, SandboxError> {
    let spec =
        spec_for(language).ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))?;

    if files.is_empty() {
        return Err(SandboxError::EmptyFileSet);
    }

    let entry = select_entry(spec, files).ok_or_else(|| SandboxError::NoEntryFile {
        language: language.to_string(),
    })?;

    Ok(plan_for(spec.family, entry))
}

fn select_entry<'a>(spec: &LanguageSpec, files: &'a [SourceFile]) -> Option<&'a str> {
    for canonical in spec.canonical {
        if let Some(file) = files.iter().find(|f| file_name(&f.path) == *canonical) {
            return Some(&file.path);
        }
    }
    files
        .iter()
        .find(|f| {
            extension(&f.path).is_some_and(|ext| spec.extensions.contains(&ext))
        })
        .map(|f| f.path.as_str())
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn extension(path: &str) -> Option<&str> {
    file_name(path).rsplit_once('.').map(|(_, ext)| ext)
}

fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn plan_for(family: Family, entry: &str) -> CommandPlan {
    let entry_file = entry.to_string();
    let (build, run, env) = match family {
        Family::Python => (
            None,
            argv(&["python3", entry]),
            vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
        ),
        Family::Node => (
            None,
            argv(&["node", entry]),
            vec![("NODE_DISABLE_COLORS".to_string(), "1".to_string())],
        ),
        Family::Ruby => (None, argv(&["ruby", entry]), Vec::new()),
        Family::Shell => (None, argv(&["sh", entry]), Vec::new()),
        Family::Go => (None, argv(&["go", "run", entry]), Vec::new()),
        Family::Rust => (
            Some(argv(&["rustc", entry, "-o", "app"])),
            argv(&["./app"]),
            Vec::new(),
        ),
        Family::C => (
            Some(argv(&["cc", entry, "-O2", "-o", "app"])),
            argv(&["./app"]),
            Vec::new(),
        ),
        Family::Cpp => (
            Some(argv(&["c++", entry, "-O2", "-o", "app"])),
            argv(&["./app"]),
            Vec::new(),
        ),
        Family::Java => (
            Some(argv(&["javac", entry])),
            argv(&["java", file_stem(entry)]),
            Vec::new(),
        ),
    };
    CommandPlan {
        entry_file,
        build,
        run,
        env,
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> SourceFile {
        SourceFile {
            path: path.to_string(),
            content: String::new(),
        }
    }

    #[test]
    fn canonical_entry_wins_over_order() {
        let files = vec![file("helper.py"), file("main.py")];
        let plan = resolve("python", &files).unwrap();
        assert_eq!(plan.entry_file, "main.py");
        assert!(plan.build.is_none());
        assert_eq!(plan.run, vec!["python3", "main.py"]);
    }

    #[test]
    fn extension_fallback_takes_first_match() {
        let files = vec![file("README.md"), file("script.py"), file("other.py")];
        let plan = resolve("python", &files).unwrap();
        assert_eq!(plan.entry_file, "script.py");
    }

    #[test]
    fn canonical_match_in_subdirectory() {
        let files = vec![file("src/index.js")];
        let plan = resolve("javascript", &files).unwrap();
        assert_eq!(plan.entry_file, "src/index.js");
        assert_eq!(plan.run, vec!["node", "src/index.js"]);
    }

    #[test]
    fn unsupported_language() {
        let err = resolve("cobol", &[file("main.cbl")]).unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }

    #[test]
    fn empty_file_set() {
        let err = resolve("python", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::EmptyFileSet));
    }

    #[test]
    fn no_entry_file() {
        let err = resolve("python", &[file("README.md")]).unwrap_err();
        assert!(matches!(err, SandboxError::NoEntryFile { .. }));
    }

    #[test]
    fn compiled_language_has_build_step() {
        let plan = resolve("rust", &[file("main.rs")]).unwrap();
        assert_eq!(plan.build.as_deref().unwrap()[0], "rustc");
        assert_eq!(plan.run, vec!["./app"]);
    }

    #[test]
    fn java_runs_class_by_stem() {
        let plan = resolve("java", &[file("Main.java")]).unwrap();
        assert_eq!(plan.build.as_deref().unwrap(), ["javac", "Main.java"]);
        assert_eq!(plan.run, vec!["java", "Main"]);
    }

    #[test]
    fn aliases_resolve_to_same_family() {
        let a = resolve("node", &[file("index.js")]).unwrap();
        let b = resolve("javascript", &[file("index.js")]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn python_sets_unbuffered() {
        let plan = resolve("python", &[file("main.py")]).unwrap();
        assert!(plan.env.iter().any(|(k, v)| k == "PYTHONUNBUFFERED" && v == "1"));
    }
}
