use regex::Regex;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source directories of this crate. Anything else under the root (reference
// material, target/) is not ours to police.
const SOURCE_DIRS: [&str; 5] = ["engine", "search", "mcmc", "cli", "tests"];

const FORBIDDEN_WORDS: &str = r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)";

// One policy check: a line pattern plus a filter deciding which matches count.
struct Check {
    pattern: Regex,
    title: &'static str,
    advice: &'static str,
    keep: fn(&str) -> bool,
}

// Collects the offending lines of one file for one check.
struct Violations {
    file_path: PathBuf,
    lines: Vec<String>,
}

impl Violations {
    fn scan(path: &Path, contents: &str, check: &Check) -> Self {
        let lines = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| check.pattern.is_match(line) && (check.keep)(line))
            .map(|(index, line)| format!("{}:{}", index + 1, line.trim_end()))
            .collect();
        Self {
            file_path: path.to_path_buf(),
            lines,
        }
    }

    fn error_message(&self, check: &Check) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.lines.len(),
            check.title,
            file_name
        );
        for line in &self.lines {
            message.push_str(&format!("   {line}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", check.advice));
        Some(message)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

// Text after the comment marker, if the line is a comment.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")?;
    let rest = &line[start + 2..];
    Some(match rest.find("*/") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    })
}

// Underscore-prefixed names outside comments and string literals.
fn underscore_in_code(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line)
}

fn all_uppercase_comment(line: &str) -> bool {
    let Some(text) = comment_text(line) else {
        return false;
    };
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn always(line: &str) -> bool {
    !line.is_empty()
}

fn checks() -> Result<Vec<Check>, Box<dyn Error>> {
    Ok(vec![
        Check {
            pattern: Regex::new(r"\b(_[a-zA-Z0-9_]+)\b")?,
            title: "underscore-prefixed variables",
            advice: "Underscore-prefixed variable names are not allowed in this project. Use the variable or remove it.",
            keep: underscore_in_code,
        },
        Check {
            pattern: Regex::new(FORBIDDEN_WORDS)?,
            title: "forbidden comment patterns",
            advice: "Comments narrating edits are not allowed. Describe the code, not its history.",
            keep: always,
        },
        Check {
            pattern: Regex::new(r"(//|/\*).*\*\*")?,
            title: "'**' patterns in regular comments",
            advice: "The '**' pattern is allowed in doc comments only.",
            keep: stars_outside_docs,
        },
        Check {
            pattern: Regex::new(r"(//|/\*)")?,
            title: "comments with all uppercase alphabetic characters",
            advice: "Comments where all alphabetic characters are uppercase are not allowed.",
            keep: all_uppercase_comment,
        },
        Check {
            pattern: Regex::new(r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]")?,
            title: "#[allow(dead_code)] attributes",
            advice: "#[allow(dead_code)] is not allowed. Use the code or remove it.",
            keep: always,
        },
    ])
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.path().to_path_buf())
        })
        .collect()
}

fn scan() -> Result<(), Box<dyn Error>> {
    let checks = checks()?;
    for path in source_files() {
        println!("cargo:rerun-if-changed={}", path.display());
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };
        for check in &checks {
            if let Some(message) = Violations::scan(&path, &contents, check).error_message(check) {
                return Err(message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = scan() {
        // eprintln! is what makes the message visible in cargo's output.
        eprintln!("{e}");
        std::process::exit(1);
    }
}
