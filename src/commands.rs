//! One function per subcommand, all sharing a [`Session`].

use crate::cli::{Command, CopyArgs, ListingArgs};
use crate::error::{Error, ErrorKind, Result};
use crate::output;
use exn::ResultExt;
use fastdbfs_config::{Config, Profile, TransferConfig};
use fastdbfs_filter::{RuleSet, RuleSpec};
use fastdbfs_mirror::{
    Context, CopyEvent, CopyOptions, CopySummary, Direction, FindEvent, FindOptions, TransferProgress, WalkOrder,
    copy_tree, find, transfer_one,
};
use fastdbfs_storage::backend::{LocalBackend, RetryPolicy, RetryingBackend};
use fastdbfs_storage::{BackendHandle, DirEntry, FileInfo};
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter, Stdout};
use tokio_util::sync::CancellationToken;

/// Whether a command that ran to the end did everything it was asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    /// Some entries failed; the rest were handled.
    Partial,
}

/// The backend and settings one invocation works with.
pub struct Session {
    backend: BackendHandle,
    ctx: Context,
}

impl Session {
    pub fn open(config: &Config, profile: Option<&str>, cancel: CancellationToken) -> Result<Self> {
        let (name, profile) = config.profile(profile).map_err(|err| {
            let reason = err.to_string();
            err.raise(ErrorKind::Config(reason))
        })?;
        tracing::debug!(profile = name, "opening backend");
        let backend = open_backend(name, profile, &config.transfer, cancel.clone())?;
        // Listings are bounded per attempt by the backend.
        let ctx = Context::default().with_chunk_size(config.transfer.chunk_size).with_cancel(cancel);
        Ok(Self { backend, ctx })
    }

    pub async fn run(&self, command: Command, rules: Vec<RuleSpec>) -> Result<Outcome> {
        let name = command.name();
        if !rules.is_empty() && !command.accepts_rules() {
            exn::bail!(ErrorKind::Usage(format!("`{name}` does not take rule options such as `{}`", rules[0])));
        }
        let rules = RuleSet::compile(rules).map_err(|err| {
            let reason = err.to_string();
            err.raise(ErrorKind::Rules(reason))
        })?;

        match command {
            Command::Ls { listing, path } => self.ls(path.unwrap_or_else(|| PathBuf::from("/")), listing).await,
            Command::Mkdir { path } => {
                self.backend.mkdir(&path).await.map_err(failed(name))?;
                Ok(Outcome::Complete)
            },
            Command::Rm { recursive, path } => {
                self.backend.delete(&path, recursive).await.map_err(failed(name))?;
                Ok(Outcome::Complete)
            },
            Command::Mv { from, to } => {
                self.backend.rename(&from, &to, false).await.map_err(failed(name))?;
                Ok(Outcome::Complete)
            },
            Command::Cat { path } => self.cat(&path).await,
            Command::Get { overwrite, source, target } => {
                let target = local_file_target(&source, target)?;
                self.transfer(name, Direction::Download, &source, &target, overwrite).await
            },
            Command::Put { overwrite, source, target } => {
                let target = self.remote_file_target(&source, target).await?;
                self.transfer(name, Direction::Upload, &source, &target, overwrite).await
            },
            Command::Find { nowarn, listing, path } => {
                self.find(path.unwrap_or_else(|| PathBuf::from("/")), rules, nowarn, listing).await
            },
            Command::Rget { copy, source, target } => {
                let target = target.unwrap_or_else(|| tree_target(&source));
                self.copy(name, Direction::Download, source, target, rules, copy).await
            },
            Command::Rput { copy, source, target } => {
                let target = target.unwrap_or_else(|| Path::new("/").join(tree_target(&source)));
                self.copy(name, Direction::Upload, source, target, rules, copy).await
            },
        }
    }

    async fn ls(&self, path: PathBuf, listing: ListingArgs) -> Result<Outcome> {
        let info = self.backend.stat(&path).await.map_err(failed("ls"))?;
        let entries = if info.is_dir { self.backend.list(&path).await.map_err(failed("ls"))? } else { vec![info] };
        let names: Vec<String> = entries.iter().map(FileInfo::basename).collect();

        let mut out = Printer::new();
        if listing.long {
            for line in output::long_listing(names.iter().map(String::as_str).zip(&entries), listing.human) {
                out.line(&line).await?;
            }
        } else {
            for name in &names {
                out.line(name).await?;
            }
        }
        out.finish().await?;
        Ok(Outcome::Complete)
    }

    async fn cat(&self, path: &Path) -> Result<Outcome> {
        let mut stdout = tokio::io::stdout();
        let mut offset = 0u64;
        loop {
            if self.ctx.cancel.is_cancelled() {
                exn::bail!(ErrorKind::Command {
                    name: "cat",
                    reason: "interrupted".to_string()
                });
            }
            let chunk = self.backend.read_range(path, offset, self.ctx.chunk_size).await.map_err(failed("cat"))?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            stdout.write_all(&chunk).await.or_raise(|| ErrorKind::Output)?;
        }
        stdout.flush().await.or_raise(|| ErrorKind::Output)?;
        Ok(Outcome::Complete)
    }

    async fn transfer(
        &self,
        name: &'static str,
        direction: Direction,
        source: &Path,
        target: &Path,
        overwrite: bool,
    ) -> Result<Outcome> {
        let progress = |p: TransferProgress| tracing::info!(bytes = p.bytes, total = p.total, "transferring");
        let bytes = transfer_one(self.backend.as_ref(), &self.ctx, direction, source, target, overwrite, Some(&progress))
            .await
            .map_err(failed(name))?;
        tracing::info!(path = %target.display(), bytes, "done");
        Ok(Outcome::Complete)
    }

    /// A remote directory target receives the file under its own name.
    async fn remote_file_target(&self, source: &Path, target: Option<PathBuf>) -> Result<PathBuf> {
        let file_name = file_name(source)?;
        let Some(target) = target else {
            return Ok(Path::new("/").join(file_name));
        };
        match self.backend.stat(&target).await {
            Ok(info) if info.is_dir => Ok(target.join(file_name)),
            Ok(_) => Ok(target),
            Err(err) if err.is_not_found() => Ok(target),
            Err(err) => Err(failed("put")(err)),
        }
    }

    async fn find(&self, root: PathBuf, rules: RuleSet, nowarn: bool, listing: ListingArgs) -> Result<Outcome> {
        let options = FindOptions {
            order: WalkOrder::DepthFirst,
            suppress_warnings: nowarn,
            include_metadata: listing.long,
        };
        let mut events = std::pin::pin!(find(self.backend.clone(), &self.ctx, root, rules, options));
        let mut out = Printer::new();
        // Long rows are aligned across the whole result, so they wait for the walk to finish.
        let mut selected: Vec<DirEntry> = Vec::new();
        let mut warnings = 0usize;
        while let Some(event) = events.next().await {
            match event.map_err(failed("find"))? {
                FindEvent::Selected(entry) if options.include_metadata => selected.push(entry),
                FindEvent::Selected(entry) => out.line(&entry.relpath).await?,
                FindEvent::Warning { path, message } => {
                    tracing::debug!(path = %path.display(), "{message}");
                    warnings += 1;
                },
            }
        }
        if options.include_metadata {
            let rows = selected.iter().map(|entry| (entry.relpath.as_str(), &entry.info));
            for line in output::long_listing(rows, listing.human) {
                out.line(&line).await?;
            }
        }
        out.finish().await?;
        if warnings > 0 {
            eprintln!("# {warnings} directories could not be listed");
        }
        Ok(Outcome::Complete)
    }

    async fn copy(
        &self,
        name: &'static str,
        direction: Direction,
        source: PathBuf,
        target: PathBuf,
        rules: RuleSet,
        args: CopyArgs,
    ) -> Result<Outcome> {
        let options = CopyOptions {
            overwrite: args.overwrite,
            sync: args.sync,
            verbose: args.verbose,
            suppress_warnings: args.nowarn,
            strict: args.strict,
        };
        let events = copy_tree(self.backend.clone(), self.ctx.clone(), direction, source, target, rules, options);
        let mut events = std::pin::pin!(events);
        let mut summary = None;
        while let Some(event) = events.next().await {
            match event.map_err(failed(name))? {
                CopyEvent::Started { source, destination } => {
                    tracing::info!(source = %source.display(), destination = %destination.display(), "{name}");
                },
                CopyEvent::Copied { relpath, .. } if args.verbose => eprintln!("{relpath}: copied."),
                CopyEvent::Failed { relpath, error } if !args.nowarn => eprintln!("{relpath}: FAILED. {error}"),
                CopyEvent::Conflict(path) if !args.nowarn => eprintln!("{}: exists, not copied.", path.display()),
                CopyEvent::Complete(done) => summary = Some(done),
                _ => {},
            }
        }
        let Some(summary) = summary else {
            exn::bail!(ErrorKind::Command {
                name,
                reason: "interrupted".to_string()
            });
        };
        eprintln!("{}", summary_line(&summary));
        Ok(if summary.is_success() { Outcome::Complete } else { Outcome::Partial })
    }
}

fn open_backend(
    name: &str,
    profile: &Profile,
    transfer: &TransferConfig,
    cancel: CancellationToken,
) -> Result<BackendHandle> {
    let inner: BackendHandle = match profile {
        #[cfg(feature = "dbfs")]
        Profile::Dbfs { host, token, .. } => Arc::new(
            fastdbfs_storage::backend::DbfsBackend::new(name, host.as_str(), token.as_str())
                .or_raise(|| ErrorKind::Backend(name.to_string()))?,
        ),
        #[cfg(not(feature = "dbfs"))]
        Profile::Dbfs { .. } => {
            exn::bail!(ErrorKind::Usage(format!("profile `{name}` needs a build with the `dbfs` feature")))
        },
        Profile::Local { root } => {
            Arc::new(LocalBackend::new(name, root).or_raise(|| ErrorKind::Backend(name.to_string()))?)
        },
    };
    let policy = RetryPolicy {
        max_retries: transfer.max_retries,
        initial: transfer.initial_backoff(),
        max: transfer.max_backoff(),
    };
    let backend = RetryingBackend::new(inner, policy)
        .with_listing_timeout(transfer.listing_timeout())
        .with_cancel(cancel);
    Ok(Arc::new(backend))
}

/// Re-raise a lower-level failure under the command's name, keeping its message.
fn failed<E>(name: &'static str) -> impl FnOnce(exn::Exn<E>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |err| {
        let reason = err.to_string();
        err.raise(ErrorKind::Command { name, reason })
    }
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| exn::Exn::from(ErrorKind::Usage(format!("`{}` does not name a file", path.display()))))
}

/// A local directory target (or none at all) receives the file under its own name.
fn local_file_target(source: &Path, target: Option<PathBuf>) -> Result<PathBuf> {
    let file_name = file_name(source)?;
    Ok(match target {
        None => PathBuf::from(file_name),
        Some(dir) if dir.is_dir() => dir.join(file_name),
        Some(target) => target,
    })
}

/// Default destination for a recursive copy: the source's last component,
/// or `.` when the source is a root or current directory.
fn tree_target(source: &Path) -> PathBuf {
    match source.components().filter(|c| !matches!(c, Component::CurDir)).next_back() {
        Some(Component::Normal(name)) => PathBuf::from(name),
        _ => PathBuf::from("."),
    }
}

fn summary_line(summary: &CopySummary) -> String {
    let mut line = format!(
        "{} copied ({}), {} unchanged, {} excluded, {} conflicts, {} failed",
        summary.copied,
        output::human_size(summary.bytes),
        summary.skipped_unchanged,
        summary.skipped_excluded,
        summary.conflicts,
        summary.failed,
    );
    if summary.listing_failures > 0 {
        line.push_str(&format!(", {} directories not listed", summary.listing_failures));
    }
    line
}

/// Buffered line writer over stdout.
struct Printer {
    out: BufWriter<Stdout>,
}

impl Printer {
    fn new() -> Self {
        Self {
            out: BufWriter::new(tokio::io::stdout()),
        }
    }

    async fn line(&mut self, line: &str) -> Result<()> {
        self.out.write_all(line.as_bytes()).await.or_raise(|| ErrorKind::Output)?;
        self.out.write_all(b"\n").await.or_raise(|| ErrorKind::Output)
    }

    async fn finish(mut self) -> Result<()> {
        self.out.flush().await.or_raise(|| ErrorKind::Output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/data/raw", "raw")]
    #[case("data/raw/", "raw")]
    #[case("./logs/.", "logs")]
    #[case("/", ".")]
    #[case(".", ".")]
    #[case("", ".")]
    fn test_tree_target(#[case] source: &str, #[case] expected: &str) {
        assert_eq!(tree_target(Path::new(source)), PathBuf::from(expected));
    }

    #[test]
    fn test_local_file_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = Path::new("/remote/report.csv");
        assert_eq!(local_file_target(source, None).unwrap(), PathBuf::from("report.csv"));
        assert_eq!(local_file_target(source, Some(dir.path().to_path_buf())).unwrap(), dir.path().join("report.csv"));
        let named = dir.path().join("renamed.csv");
        assert_eq!(local_file_target(source, Some(named.clone())).unwrap(), named);
        assert!(matches!(&*local_file_target(Path::new("/"), None).unwrap_err(), ErrorKind::Usage(_)));
    }

    #[test]
    fn test_summary_line() {
        let summary = CopySummary {
            copied: 3,
            bytes: 1536,
            skipped_unchanged: 2,
            conflicts: 1,
            listing_failures: 1,
            ..CopySummary::default()
        };
        assert_eq!(
            summary_line(&summary),
            "3 copied (1.5K), 2 unchanged, 0 excluded, 1 conflicts, 0 failed, 1 directories not listed"
        );
    }

    fn local_session(root: &Path) -> Session {
        let backend: BackendHandle = Arc::new(LocalBackend::new("test", root).unwrap());
        Session {
            backend,
            ctx: Context::default(),
        }
    }

    #[tokio::test]
    async fn test_rules_rejected_for_plain_commands() {
        let dir = tempfile::tempdir().unwrap();
        let session = local_session(dir.path());
        let command = Command::Mkdir { path: PathBuf::from("/x") };
        let err = session.run(command, vec![RuleSpec::new("name", "*.txt")]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Usage(_)));
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_bad_rule_fails_before_walking() {
        let dir = tempfile::tempdir().unwrap();
        let session = local_session(dir.path());
        let command = Command::Find {
            nowarn: false,
            listing: ListingArgs { long: false, human: false },
            path: None,
        };
        let err = session.run(command, vec![RuleSpec::new("re", "(unclosed")]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Rules(_)));
    }

    #[tokio::test]
    async fn test_put_into_remote_directory() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        std::fs::create_dir(remote.path().join("inbox")).unwrap();
        let source = local.path().join("note.txt");
        std::fs::write(&source, b"hello").unwrap();

        let session = local_session(remote.path());
        let command = Command::Put {
            overwrite: false,
            source,
            target: Some(PathBuf::from("/inbox")),
        };
        assert_eq!(session.run(command, vec![]).await.unwrap(), Outcome::Complete);
        assert_eq!(std::fs::read(remote.path().join("inbox/note.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_rget_conflicts_do_not_fail_the_copy() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("data")).unwrap();
        std::fs::write(remote.path().join("data/a.txt"), b"a").unwrap();
        std::fs::write(remote.path().join("data/b.txt"), b"b").unwrap();
        // A directory where a file should land is a conflict, not a failure.
        std::fs::create_dir_all(local.path().join("b.txt")).unwrap();

        let session = local_session(remote.path());
        let copy = CopyArgs {
            verbose: false,
            nowarn: true,
            overwrite: false,
            sync: false,
            strict: false,
        };
        let command = Command::Rget {
            copy,
            source: PathBuf::from("/data"),
            target: Some(local.path().to_path_buf()),
        };
        assert_eq!(session.run(command, vec![]).await.unwrap(), Outcome::Complete);
        assert_eq!(std::fs::read(local.path().join("a.txt")).unwrap(), b"a");
    }
}
