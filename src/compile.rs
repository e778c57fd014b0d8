//! LaTeX compilation inside a sandbox and retrieval of the resulting PDF.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{SandboxError, SandboxResult};
use crate::executor::{argv, CommandExecutor};
use crate::files::{validate_path, ProjectFiles};
use crate::models::{CompileResponse, SandboxKey};
use crate::runtime::ContainerRuntime;
use crate::settings::ManagerConfig;

/// Tried in order when the requested main file does not exist.
pub const FALLBACK_MAIN_FILES: &[&str] = &["paper.tex", "main.tex", "document.tex", "article.tex"];

const PDF_MAGIC: &str = "%PDF";
const LOG_TAIL: usize = 4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One `latexmk` run that handles bibliography and reruns itself.
    Latexmk,
    /// `pdflatex`, then `bibtex` and two more `pdflatex` runs when the project has a `.bib`.
    ManualPasses,
}

impl Strategy {
    pub const ORDER: [Strategy; 2] = [Strategy::Latexmk, Strategy::ManualPasses];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Latexmk => "latexmk",
            Strategy::ManualPasses => "pdflatex",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PdfState {
    Missing,
    Empty,
    NotPdf,
    Valid,
}

pub struct Compiler {
    executor: Arc<CommandExecutor>,
    runtime: Arc<dyn ContainerRuntime>,
    files: Arc<ProjectFiles>,
    config: Arc<ManagerConfig>,
}

impl Compiler {
    pub fn new(
        executor: Arc<CommandExecutor>,
        runtime: Arc<dyn ContainerRuntime>,
        files: Arc<ProjectFiles>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            executor,
            runtime,
            files,
            config,
        }
    }

    async fn resolve_main(&self, key: &SandboxKey, requested: &str) -> SandboxResult<String> {
        if self.files.exists(key, requested).await? {
            return Ok(requested.to_string());
        }
        for candidate in FALLBACK_MAIN_FILES {
            if self.files.exists(key, candidate).await? {
                info!("{requested} not found for {key}; compiling {candidate} instead");
                return Ok(candidate.to_string());
            }
        }
        Err(SandboxError::CompileFailed(format!(
            "{requested} not found and none of {} exist",
            FALLBACK_MAIN_FILES.join(", ")
        )))
    }

    pub async fn compile(&self, key: &SandboxKey, tex_file: &str) -> SandboxResult<CompileResponse> {
        let requested = validate_path(tex_file)?;
        if !requested.ends_with(".tex") {
            return Err(SandboxError::InvalidRequest(format!(
                "{requested} is not a .tex file"
            )));
        }
        let main = self.resolve_main(key, &requested).await?;
        let stem = Path::new(&main)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());
        let pdf_file = format!("{stem}.pdf");

        let mut log = String::new();
        let mut used = None;
        for strategy in Strategy::ORDER {
            if self.attempt(key, strategy, &main, &stem, &mut log).await? {
                used = Some(strategy);
                break;
            }
            warn!("{} did not build {main} for {key}", strategy.name());
        }
        let Some(strategy) = used else {
            return Err(SandboxError::CompileFailed(format!(
                "every strategy failed for {main}:\n{}",
                tail(&log, LOG_TAIL)
            )));
        };

        if let Err(error) = self.executor.run(key, &argv(["sync"]), None, &[]).await {
            warn!("sync after compiling {main} failed: {error}");
        }
        match self.pdf_state(key, &pdf_file).await? {
            PdfState::Valid => {}
            state => {
                return Err(SandboxError::CompileFailed(format!(
                    "{} reported success but {pdf_file} is {}",
                    strategy.name(),
                    describe(state)
                )))
            }
        }

        info!("compiled {main} for {key} with {}", strategy.name());
        Ok(CompileResponse {
            pdf_file,
            strategy: strategy.name().to_string(),
            log,
        })
    }

    /// Runs one strategy. `Ok(false)` means it ran and failed; the next one may still work.
    async fn attempt(
        &self,
        key: &SandboxKey,
        strategy: Strategy,
        main: &str,
        stem: &str,
        log: &mut String,
    ) -> SandboxResult<bool> {
        let pdflatex = argv(["pdflatex", "-interaction=nonstopmode", main]);
        match strategy {
            Strategy::Latexmk => {
                let latexmk = argv([
                    "latexmk",
                    "-pdf",
                    "-interaction=nonstopmode",
                    "-output-directory=.",
                    main,
                ]);
                self.pass(key, &latexmk, log).await
            }
            Strategy::ManualPasses => {
                if !self.pass(key, &pdflatex, log).await? {
                    return Ok(false);
                }
                let has_bibliography = self
                    .executor
                    .probe(key, &argv(["sh", "-c", "ls *.bib >/dev/null 2>&1"]))
                    .await?;
                if !has_bibliography {
                    return Ok(true);
                }
                let aux = format!("{stem}.aux");
                if !self.pass(key, &argv(["bibtex", aux.as_str()]), log).await? {
                    // The first pass already produced a PDF, just without references.
                    return Ok(true);
                }
                for _ in 0..2 {
                    if !self.pass(key, &pdflatex, log).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    async fn pass(&self, key: &SandboxKey, command: &[String], log: &mut String) -> SandboxResult<bool> {
        log.push_str(&format!("$ {}\n", command.join(" ")));
        match self.executor.run(key, command, None, &[]).await {
            Ok(output) => {
                append_output(log, &output.stdout, &output.stderr);
                Ok(true)
            }
            Err(SandboxError::CommandFailed {
                exit_code,
                stdout,
                stderr,
            }) => {
                append_output(log, &stdout, &stderr);
                log.push_str(&format!("(exit code {exit_code})\n"));
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    async fn pdf_state(&self, key: &SandboxKey, path: &str) -> SandboxResult<PdfState> {
        if !self.executor.probe(key, &argv(["test", "-f", path])).await? {
            return Ok(PdfState::Missing);
        }
        if !self.executor.probe(key, &argv(["test", "-s", path])).await? {
            return Ok(PdfState::Empty);
        }
        let header = self
            .executor
            .run(key, &argv(["head", "-c", "4", path]), None, &[])
            .await?;
        Ok(if header.stdout == PDF_MAGIC {
            PdfState::Valid
        } else {
            PdfState::NotPdf
        })
    }

    /// Returns the bytes of a compiled PDF inside the project.
    pub async fn fetch_pdf(&self, key: &SandboxKey, path: &str) -> SandboxResult<Vec<u8>> {
        let path = validate_path(path)?;
        if !path.to_ascii_lowercase().ends_with(".pdf") {
            return Err(SandboxError::InvalidRequest(format!("{path} is not a PDF")));
        }
        match self.pdf_state(key, &path).await? {
            PdfState::Valid => {}
            PdfState::Missing => return Err(SandboxError::NotFound(format!("file {path}"))),
            state => {
                return Err(SandboxError::CompileFailed(format!(
                    "{path} is {}",
                    describe(state)
                )))
            }
        }

        let sandbox = self.executor.registry().get_or_create(key).await?;
        let absolute = format!("{}/{path}", self.config.workdir.trim_end_matches('/'));
        let archive = self
            .runtime
            .download_archive(&sandbox.container_id, &absolute)
            .await?;
        let name = Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        extract_file(&archive, &name)?
            .ok_or_else(|| SandboxError::Internal(format!("{path} missing from the archive")))
    }
}

/// Pulls the regular file called `name` out of a tar archive.
pub fn extract_file(archive: &[u8], name: &str) -> SandboxResult<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matches = entry
            .path()?
            .file_name()
            .is_some_and(|file_name| file_name.to_string_lossy() == name);
        if matches {
            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut contents)?;
            return Ok(Some(contents));
        }
    }
    Ok(None)
}

fn append_output(log: &mut String, stdout: &str, stderr: &str) {
    for part in [stdout, stderr] {
        if !part.trim().is_empty() {
            log.push_str(part.trim_end());
            log.push('\n');
        }
    }
}

fn describe(state: PdfState) -> &'static str {
    match state {
        PdfState::Missing => "missing",
        PdfState::Empty => "empty",
        PdfState::NotPdf => "not a PDF",
        PdfState::Valid => "valid",
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_named_entry() {
        let archive = archive_with(&[("notes.txt", b"x"), ("main.pdf", b"%PDF-1.5 body")]);
        assert_eq!(
            extract_file(&archive, "main.pdf").unwrap().as_deref(),
            Some(&b"%PDF-1.5 body"[..])
        );
        assert_eq!(extract_file(&archive, "other.pdf").unwrap(), None);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }
}
