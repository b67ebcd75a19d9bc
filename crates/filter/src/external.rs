use fastdbfs_storage::DirEntry;
use std::process::{Command, Stdio};

/// Run a user command for one entry; a zero exit status is a match.
///
/// The command goes through `sh -c` with the relative path as `$1`, and the
/// entry's metadata in `FASTDBFS_*` environment variables.
pub(crate) fn matches(command: &str, entry: &DirEntry) -> bool {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .arg("sh")
        .arg(&entry.relpath)
        .env("FASTDBFS_PATH", &entry.relpath)
        .env("FASTDBFS_BASENAME", entry.basename())
        .env("FASTDBFS_TYPE", entry.info.kind())
        .env("FASTDBFS_SIZE", entry.size().to_string())
        .env("FASTDBFS_MTIME", entry.modified().unix_timestamp().to_string())
        .stdin(Stdio::null())
        .status();
    match status {
        Ok(status) => {
            tracing::trace!(path = %entry.relpath, %status, "external filter finished");
            status.success()
        },
        Err(err) => {
            tracing::warn!(path = %entry.relpath, command, "unable to run external filter: {err}");
            false
        },
    }
}
