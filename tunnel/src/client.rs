//! A thin blocking client for every subcommand except `run`/`run-host`:
//! connect to the already-running daemon's command socket, send one JSON
//! command line, print back its response. Mirrors the synchronous
//! connect-and-round-trip shape `control::plane::reject_conflicting_peer`
//! already uses for the startup peer check.
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

pub fn send(cmd_path: &Path, request: Value) -> utils::error::Result<Value, String> {
	let mut stream = UnixStream::connect(cmd_path).map_err(|err| format!("failed to connect to {}: {err}", cmd_path.display()))?;
	stream.set_read_timeout(Some(Duration::from_secs(10))).map_err(|err| err.to_string())?;

	writeln!(stream, "{request}").map_err(|err| err.to_string())?;

	let mut reader = BufReader::new(stream);
	let mut line = String::new();
	reader.read_line(&mut line).map_err(|err| err.to_string())?;

	serde_json::from_str(&line).map_err(|err| format!("malformed response: {err}"))
}
