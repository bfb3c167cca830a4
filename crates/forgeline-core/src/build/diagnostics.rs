//! Turns raw Maven / Gradle / javac / kotlinc output into structured diagnostics.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::pipeline::artifacts::{BuildDiagnostic, Severity};

/// `[ERROR] /src/main/java/App.java:[12,5] cannot find symbol`
static MAVEN_COMPILER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(ERROR|WARNING)\]\s+(?:file:)?(\S+?\.(?:java|kt|kts|scala|groovy)):\[(\d+)(?:,(\d+))?\]\s*(.*)$")
        .expect("valid regex")
});

/// `e: file:///src/App.kt:12:5 Unresolved reference: foo`
/// `w: /src/App.kt: (12, 5): Parameter 'x' is never used`
static KOTLIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(e|w):\s+(?:file://)?(\S+?\.kts?)(?::(\d+):(\d+)|:\s*\((\d+),\s*(\d+)\):?)\s*(.*)$",
    )
    .expect("valid regex")
});

/// `/src/App.java:12: error: ';' expected`
static JAVAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+?\.java):(\d+):\s+(error|warning):\s+(.*)$").expect("valid regex")
});

/// `Tests run: 10, Failures: 1, Errors: 0, Skipped: 0`
static SUREFIRE_TOTALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+),\s*Errors:\s*(\d+)").expect("valid regex")
});

/// `AppTest > rendersHome() FAILED`
static GRADLE_TEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+>\s+(.+?)\s+FAILED$").expect("valid regex"));

/// `[ERROR] Failed to execute goal ...` and `FAILURE: Build failed ...`
static BUILD_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[ERROR\]\s+(Failed to execute goal.*)|FAILURE:\s+(.*))$").expect("valid regex")
});

fn severity(tag: &str) -> Severity {
    match tag {
        "ERROR" | "e" | "error" => Severity::Error,
        _ => Severity::Warning,
    }
}

fn num(m: Option<regex::Match<'_>>) -> Option<u32> {
    m.and_then(|m| m.as_str().parse().ok())
}

fn parse_line(line: &str) -> Option<BuildDiagnostic> {
    let line = line.trim_end();

    if let Some(c) = MAVEN_COMPILER.captures(line) {
        return Some(BuildDiagnostic {
            file: Some(c[2].to_string()),
            line: num(c.get(3)),
            column: num(c.get(4)),
            severity: severity(&c[1]),
            message: c[5].trim().to_string(),
        });
    }

    if let Some(c) = KOTLIN.captures(line) {
        return Some(BuildDiagnostic {
            file: Some(c[2].to_string()),
            line: num(c.get(3).or(c.get(5))),
            column: num(c.get(4).or(c.get(6))),
            severity: severity(&c[1]),
            message: c[7].trim().to_string(),
        });
    }

    if let Some(c) = JAVAC.captures(line) {
        return Some(BuildDiagnostic {
            file: Some(c[1].to_string()),
            line: num(c.get(2)),
            column: None,
            severity: severity(&c[3]),
            message: c[4].trim().to_string(),
        });
    }

    if let Some(c) = GRADLE_TEST.captures(line) {
        return Some(BuildDiagnostic {
            file: None,
            line: None,
            column: None,
            severity: Severity::Error,
            message: format!("test {} > {} failed", &c[1], &c[2]),
        });
    }

    if let Some(c) = BUILD_FAILURE.captures(line) {
        let message = c.get(1).or(c.get(2)).map(|m| m.as_str().trim())?;
        return Some(BuildDiagnostic {
            file: None,
            line: None,
            column: None,
            severity: Severity::Error,
            message: message.to_string(),
        });
    }

    None
}

/// Parse accumulated output. Duplicates (Maven repeats compiler errors in its
/// summary) are reported once. Failed surefire totals become one diagnostic.
pub fn parse_build_output(lines: &[String]) -> Vec<BuildDiagnostic> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut failed_tests = 0u64;

    for line in lines {
        if let Some(c) = SUREFIRE_TOTALS.captures(line) {
            let failures: u64 = c[2].parse().unwrap_or(0);
            let errors: u64 = c[3].parse().unwrap_or(0);
            // Per-class lines precede the aggregate; keep the largest total.
            failed_tests = failed_tests.max(failures + errors);
            continue;
        }
        if let Some(diag) = parse_line(line) {
            let key = (diag.file.clone(), diag.line, diag.column, diag.message.clone());
            if seen.insert(key) {
                out.push(diag);
            }
        }
    }

    if failed_tests > 0 {
        out.push(BuildDiagnostic {
            file: None,
            line: None,
            column: None,
            severity: Severity::Error,
            message: format!("{} test(s) failed", failed_tests),
        });
    }
    out
}

/// One-line failure summary for events and fix hints.
pub fn summarize(diagnostics: &[BuildDiagnostic], output_tail: &[String]) -> String {
    let errors: Vec<&BuildDiagnostic> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();

    if errors.is_empty() {
        return output_tail
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(|l| format!("build failed: {}", l))
            .unwrap_or_else(|| "build failed".to_string());
    }

    let shown: Vec<String> = errors.iter().take(3).map(|d| describe(d)).collect();
    let mut summary = format!("{} error(s): {}", errors.len(), shown.join("; "));
    if errors.len() > shown.len() {
        summary.push_str("; ...");
    }
    summary
}

fn describe(d: &BuildDiagnostic) -> String {
    match (&d.file, d.line) {
        (Some(file), Some(line)) => format!("{}:{} {}", file, line, d.message),
        (Some(file), None) => format!("{} {}", file, d.message),
        _ => d.message.clone(),
    }
}
