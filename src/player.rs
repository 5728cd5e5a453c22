//! Media player seam and the mpv implementation.
//!
//! The synchronizer only talks to [`MediaPlayer`]. `MpvPlayer` drives a
//! long-lived `mpv --idle` process over its JSON IPC socket; every request
//! carries a `request_id` and unrelated lines (events) are handled while
//! waiting for the matching reply.

use crate::error::{Error, Result};
use crate::sync::{Clock, ManualClock};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// Key bindings mpv forwards to us as `client-message` events.
pub const CHANNEL_UP_MESSAGE: &str = "channel-up";
pub const CHANNEL_DOWN_MESSAGE: &str = "channel-down";

pub trait MediaPlayer {
    /// Replace whatever is playing with `path`.
    fn load(&mut self, path: &Path) -> Result<()>;
    /// Seek to `offset_secs`, absolute from the start of the file or relative
    /// to the current position.
    fn seek(&mut self, offset_secs: f64, absolute: bool) -> Result<()>;
    fn set_pause(&mut self, paused: bool) -> Result<()>;
    fn is_paused(&mut self) -> Result<bool>;
    /// `None` while no file is loaded or the position is unknown.
    fn position_secs(&mut self) -> Result<Option<f64>>;
    fn duration_secs(&mut self) -> Result<Option<f64>>;
    fn is_seekable(&mut self) -> Result<bool>;
    fn show_overlay(&mut self, text: &str) -> Result<()>;
    fn clear_overlay(&mut self) -> Result<()>;
}

#[cfg(unix)]
pub use mpv::MpvPlayer;

#[cfg(unix)]
mod mpv {
    use super::{CHANNEL_DOWN_MESSAGE, CHANNEL_UP_MESSAGE, MediaPlayer};
    use crate::error::{Error, Result};
    use crate::sync::{TunerCommand, TunerHandle};
    use log::{debug, info, warn};
    use serde_json::{Value, json};
    use std::io::{BufRead, BufReader, ErrorKind, Write};
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use std::process::{Child, Command, Stdio};
    use std::time::Duration;

    const CONNECT_ATTEMPTS: usize = 60;
    const CONNECT_INTERVAL: Duration = Duration::from_millis(100);
    const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
    const OVERLAY_ID: u64 = 1;

    pub struct MpvPlayer {
        child: Child,
        writer: UnixStream,
        reader: BufReader<UnixStream>,
        next_id: u64,
        tuner: Option<TunerHandle>,
        socket: PathBuf,
    }

    impl MpvPlayer {
        /// Start mpv fullscreen and idle, listening on `socket`. Key presses
        /// bound to channel up/down are forwarded to `tuner`.
        pub fn spawn(binary: &str, socket: &Path, tuner: Option<TunerHandle>) -> Result<Self> {
            if socket.exists() {
                std::fs::remove_file(socket)?;
            }
            info!("launching {} with IPC socket {}", binary, socket.display());
            let mut child = Command::new(binary)
                .arg("--idle=yes")
                .arg("--keep-open=yes")
                .arg("--force-window=yes")
                .arg("--fullscreen")
                .arg("--osd-level=0")
                .arg(format!("--input-ipc-server={}", socket.display()))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| Error::Player(format!("failed to launch {binary}: {e}")))?;

            let mut stream = None;
            for _ in 0..CONNECT_ATTEMPTS {
                std::thread::sleep(CONNECT_INTERVAL);
                match UnixStream::connect(socket) {
                    Ok(s) => {
                        stream = Some(s);
                        break;
                    }
                    Err(_) => {
                        if let Ok(Some(status)) = child.try_wait() {
                            return Err(Error::Player(format!(
                                "mpv exited before IPC connected ({status})"
                            )));
                        }
                    }
                }
            }
            let Some(stream) = stream else {
                let _ = child.kill();
                return Err(Error::Player(format!(
                    "timed out connecting to {}",
                    socket.display()
                )));
            };
            stream.set_read_timeout(Some(REPLY_TIMEOUT))?;

            let mut player = MpvPlayer {
                child,
                reader: BufReader::new(stream.try_clone()?),
                writer: stream,
                next_id: 1,
                tuner,
                socket: socket.to_path_buf(),
            };
            player.bind_tuner_keys()?;
            Ok(player)
        }

        fn bind_tuner_keys(&mut self) -> Result<()> {
            for (key, message) in [
                ("w", CHANNEL_UP_MESSAGE),
                ("UP", CHANNEL_UP_MESSAGE),
                ("s", CHANNEL_DOWN_MESSAGE),
                ("DOWN", CHANNEL_DOWN_MESSAGE),
            ] {
                let command = format!("script-message {message}");
                self.command(json!(["keybind", key, command]))?;
            }
            Ok(())
        }

        /// Send one command and wait for its reply. Returns the `data` field
        /// on success, `None` when mpv reports the property unavailable.
        fn command(&mut self, args: Value) -> Result<Option<Value>> {
            let id = self.next_id;
            self.next_id += 1;
            let mut line = json!({ "command": &args, "request_id": id }).to_string();
            line.push('\n');
            self.writer
                .write_all(line.as_bytes())
                .map_err(|e| Error::Player(format!("IPC write failed: {e}")))?;

            loop {
                let reply = self.read_line()?;
                if reply.get("event").is_some() {
                    self.handle_event(&reply);
                    continue;
                }
                if reply.get("request_id").and_then(Value::as_u64) != Some(id) {
                    continue;
                }
                return match reply.get("error").and_then(Value::as_str) {
                    Some("success") | None => Ok(reply.get("data").cloned()),
                    Some("property unavailable") => Ok(None),
                    Some(err) => Err(Error::Player(format!("{args}: {err}"))),
                };
            }
        }

        fn read_line(&mut self) -> Result<Value> {
            let mut line = String::new();
            loop {
                line.clear();
                let n = match self.reader.read_line(&mut line) {
                    Ok(n) => n,
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        return Err(Error::Player("IPC reply timed out".into()));
                    }
                    Err(e) => return Err(Error::Player(format!("IPC read failed: {e}"))),
                };
                if n == 0 {
                    return Err(Error::Player("mpv IPC closed".into()));
                }
                match serde_json::from_str(&line) {
                    Ok(v) => return Ok(v),
                    Err(_) => debug!("ignoring IPC line: {}", line.trim()),
                }
            }
        }

        fn handle_event(&self, event: &Value) {
            if event.get("event").and_then(Value::as_str) != Some("client-message") {
                return;
            }
            let message = event
                .get("args")
                .and_then(Value::as_array)
                .and_then(|args| args.first())
                .and_then(Value::as_str);
            let command = match message {
                Some(CHANNEL_UP_MESSAGE) => TunerCommand::ChannelUp,
                Some(CHANNEL_DOWN_MESSAGE) => TunerCommand::ChannelDown,
                _ => return,
            };
            if let Some(tuner) = &self.tuner {
                tuner.send(command);
            }
        }

        fn property(&mut self, name: &str) -> Result<Option<Value>> {
            self.command(json!(["get_property", name]))
        }
    }

    impl MediaPlayer for MpvPlayer {
        fn load(&mut self, path: &Path) -> Result<()> {
            let path = path.to_string_lossy();
            self.command(json!(["loadfile", path, "replace"]))?;
            Ok(())
        }

        fn seek(&mut self, offset_secs: f64, absolute: bool) -> Result<()> {
            let mode = if absolute { "absolute" } else { "relative" };
            self.command(json!(["seek", offset_secs, mode]))?;
            Ok(())
        }

        fn set_pause(&mut self, paused: bool) -> Result<()> {
            self.command(json!(["set_property", "pause", paused]))?;
            Ok(())
        }

        fn is_paused(&mut self) -> Result<bool> {
            Ok(self
                .property("pause")?
                .and_then(|v| v.as_bool())
                .unwrap_or(true))
        }

        fn position_secs(&mut self) -> Result<Option<f64>> {
            Ok(self.property("time-pos")?.and_then(|v| v.as_f64()))
        }

        fn duration_secs(&mut self) -> Result<Option<f64>> {
            Ok(self.property("duration")?.and_then(|v| v.as_f64()))
        }

        fn is_seekable(&mut self) -> Result<bool> {
            Ok(self
                .property("seekable")?
                .and_then(|v| v.as_bool())
                .unwrap_or(false))
        }

        fn show_overlay(&mut self, text: &str) -> Result<()> {
            // ASS: bottom-left, white text with a dark border.
            let ass = format!("{{\\an1\\fs28\\bord2}}{}", text.replace('{', "(").replace('}', ")"));
            self.command(json!({
                "name": "osd-overlay",
                "id": OVERLAY_ID,
                "format": "ass-events",
                "data": ass,
            }))?;
            Ok(())
        }

        fn clear_overlay(&mut self) -> Result<()> {
            self.command(json!({
                "name": "osd-overlay",
                "id": OVERLAY_ID,
                "format": "none",
                "data": "",
            }))?;
            Ok(())
        }
    }

    impl Drop for MpvPlayer {
        fn drop(&mut self) {
            let _ = self
                .writer
                .write_all(b"{\"command\": [\"quit\"]}\n");
            if let Err(e) = self.child.wait() {
                warn!("mpv did not exit cleanly: {e}");
            }
            let _ = std::fs::remove_file(&self.socket);
        }
    }
}

/// In-memory player for tests and dry runs. While unpaused its playhead
/// follows the shared [`ManualClock`], clamped to the file duration the way
/// mpv holds the last frame with `--keep-open`.
#[derive(Debug)]
pub struct FakePlayer {
    clock: ManualClock,
    pub loaded: Option<PathBuf>,
    pub duration: Option<f64>,
    pub paused: bool,
    pub seekable: bool,
    pub overlay: Option<String>,
    /// Every seek target, in order.
    pub seeks: Vec<f64>,
    /// Every file loaded, in order.
    pub history: Vec<PathBuf>,
    /// Duration reported for each newly loaded file; `None` never gets ready.
    pub file_duration: Option<f64>,
    /// Playhead stops here, simulating a decoder stall.
    pub freeze_at: Option<f64>,
    anchor_pos: Option<f64>,
    anchor_time: NaiveDateTime,
}

impl FakePlayer {
    pub fn new(clock: ManualClock, file_duration: Option<f64>) -> Self {
        let anchor_time = clock.now();
        FakePlayer {
            clock,
            loaded: None,
            duration: None,
            paused: true,
            seekable: false,
            overlay: None,
            seeks: Vec::new(),
            history: Vec::new(),
            file_duration,
            freeze_at: None,
            anchor_pos: None,
            anchor_time,
        }
    }

    fn current(&self) -> Option<f64> {
        let base = self.anchor_pos?;
        let mut pos = base;
        if !self.paused {
            let elapsed = (self.clock.now() - self.anchor_time).num_milliseconds() as f64 / 1000.0;
            pos += elapsed.max(0.0);
        }
        if let Some(limit) = self.freeze_at {
            pos = pos.min(limit.max(base));
        }
        if let Some(d) = self.duration {
            pos = pos.min(d);
        }
        Some(pos)
    }

    fn rebase(&mut self, pos: Option<f64>) {
        self.anchor_pos = pos;
        self.anchor_time = self.clock.now();
    }
}

impl MediaPlayer for FakePlayer {
    fn load(&mut self, path: &Path) -> Result<()> {
        self.loaded = Some(path.to_path_buf());
        self.history.push(path.to_path_buf());
        self.duration = self.file_duration;
        self.seekable = self.file_duration.is_some();
        self.paused = true;
        self.rebase(Some(0.0));
        Ok(())
    }

    fn seek(&mut self, offset_secs: f64, absolute: bool) -> Result<()> {
        let Some(pos) = self.current() else {
            return Err(Error::PlayerNotReady("nothing loaded".into()));
        };
        let target = if absolute { offset_secs } else { pos + offset_secs };
        self.seeks.push(target);
        self.rebase(Some(target));
        Ok(())
    }

    fn set_pause(&mut self, paused: bool) -> Result<()> {
        let pos = self.current();
        self.paused = paused;
        self.rebase(pos);
        Ok(())
    }

    fn is_paused(&mut self) -> Result<bool> {
        Ok(self.paused)
    }

    fn position_secs(&mut self) -> Result<Option<f64>> {
        Ok(self.current())
    }

    fn duration_secs(&mut self) -> Result<Option<f64>> {
        Ok(self.duration)
    }

    fn is_seekable(&mut self) -> Result<bool> {
        Ok(self.seekable)
    }

    fn show_overlay(&mut self, text: &str) -> Result<()> {
        self.overlay = Some(text.to_string());
        Ok(())
    }

    fn clear_overlay(&mut self) -> Result<()> {
        self.overlay = None;
        Ok(())
    }
}
