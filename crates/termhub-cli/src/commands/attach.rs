//! `termhub attach <url|id>`: interactive viewer for a running session.
//!
//! Enters raw mode, forwards keystrokes as `input` frames and terminal
//! resizes as `resize` frames, and writes `output` frames to stdout. The
//! stream reconnects on transient drops. Ctrl+] detaches.

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::io::Write;
use termhub_client::{ReconnectPolicy, ReconnectingSession, SessionEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::terminal as term;

/// Attach to `url`. Returns the exit status the CLI should end with.
pub async fn run(url: &str, policy: ReconnectPolicy) -> Result<i32> {
    info!(url, "attaching");

    let (cols, rows) = term::get_terminal_size();
    let mut session = ReconnectingSession::spawn(url, policy);
    session.resize(cols, rows).await;

    let _guard = term::RawModeGuard::enter().context("failed to enter raw terminal mode")?;

    let (tx_input, mut rx_input) = mpsc::channel::<String>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<(u16, u16)>(8);
    let (tx_quit, mut rx_quit) = mpsc::channel::<()>(1);

    // A plain thread: crossterm's read blocks and must not hold up runtime shutdown.
    std::thread::Builder::new()
        .name("termhub-input".into())
        .spawn(move || loop {
            match event::read() {
                Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                    if is_detach_key(&key) {
                        let _ = tx_quit.blocking_send(());
                        break;
                    }
                    if let Some(data) = key_event_to_input(&key) {
                        if tx_input.blocking_send(data).is_err() {
                            break;
                        }
                    }
                }
                Ok(Event::Resize(c, r)) => {
                    if tx_resize.blocking_send((c, r)).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("crossterm event error: {e}");
                    break;
                }
            }
        })
        .context("failed to start input thread")?;

    let mut stdout = std::io::stdout();
    let mut status = 0;

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(SessionEvent::Output(data)) => {
                    stdout.write_all(data.as_bytes())?;
                    stdout.flush()?;
                }
                Some(SessionEvent::Connected) => debug!("stream connected"),
                Some(SessionEvent::Exit(code)) => {
                    status = code;
                }
                Some(SessionEvent::Error(message)) => {
                    eprint!("\r\ntermhub: {message}\r\n");
                }
                Some(SessionEvent::Reconnecting { attempt, delay }) => {
                    eprint!(
                        "\r\n[connection lost, retrying in {}ms (attempt {attempt})]\r\n",
                        delay.as_millis()
                    );
                }
                Some(SessionEvent::GaveUp { attempts, last }) => {
                    eprint!("\r\ntermhub: gave up after {attempts} attempts: {last}\r\n");
                    status = 1;
                    break;
                }
                Some(SessionEvent::Closed { reason }) => {
                    info!(reason = %reason, "stream closed");
                    eprint!("\r\n[{reason}]\r\n");
                    break;
                }
                None => break,
            },
            Some(data) = rx_input.recv() => session.send_input(data).await,
            Some((c, r)) = rx_resize.recv() => session.resize(c, r).await,
            _ = rx_quit.recv() => {
                info!("detach requested");
                session.close().await;
                eprint!("\r\n[detached]\r\n");
                break;
            }
        }
    }

    Ok(status)
}

fn is_detach_key(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']')
}

/// Translate a key press into the text a terminal would send.
fn key_event_to_input(key: &KeyEvent) -> Option<String> {
    let base = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let lower = c.to_ascii_lowercase();
            if lower.is_ascii_lowercase() {
                // Ctrl+A = 0x01 .. Ctrl+Z = 0x1a
                char::from(lower as u8 - b'a' + 1).to_string()
            } else {
                c.to_string()
            }
        }
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "\r".into(),
        KeyCode::Backspace => "\x7f".into(),
        KeyCode::Tab => "\t".into(),
        KeyCode::BackTab => "\x1b[Z".into(),
        KeyCode::Esc => "\x1b".into(),
        KeyCode::Up => "\x1b[A".into(),
        KeyCode::Down => "\x1b[B".into(),
        KeyCode::Right => "\x1b[C".into(),
        KeyCode::Left => "\x1b[D".into(),
        KeyCode::Home => "\x1b[H".into(),
        KeyCode::End => "\x1b[F".into(),
        KeyCode::PageUp => "\x1b[5~".into(),
        KeyCode::PageDown => "\x1b[6~".into(),
        KeyCode::Insert => "\x1b[2~".into(),
        KeyCode::Delete => "\x1b[3~".into(),
        KeyCode::F(n) => match n {
            1 => "\x1bOP",
            2 => "\x1bOQ",
            3 => "\x1bOR",
            4 => "\x1bOS",
            5 => "\x1b[15~",
            6 => "\x1b[17~",
            7 => "\x1b[18~",
            8 => "\x1b[19~",
            9 => "\x1b[20~",
            10 => "\x1b[21~",
            11 => "\x1b[23~",
            12 => "\x1b[24~",
            _ => return None,
        }
        .into(),
        _ => return None,
    };

    if key.modifiers.contains(KeyModifiers::ALT) {
        Some(format!("\x1b{base}"))
    } else {
        Some(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn control_letters_map_to_c0_codes() {
        let ctrl_c = key(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(key_event_to_input(&ctrl_c).as_deref(), Some("\x03"));
        let ctrl_shift_d = key(KeyCode::Char('D'), KeyModifiers::CONTROL);
        assert_eq!(key_event_to_input(&ctrl_shift_d).as_deref(), Some("\x04"));
    }

    #[test]
    fn plain_and_special_keys() {
        assert_eq!(
            key_event_to_input(&key(KeyCode::Char('é'), KeyModifiers::NONE)).as_deref(),
            Some("é")
        );
        assert_eq!(
            key_event_to_input(&key(KeyCode::Enter, KeyModifiers::NONE)).as_deref(),
            Some("\r")
        );
        assert_eq!(
            key_event_to_input(&key(KeyCode::Up, KeyModifiers::NONE)).as_deref(),
            Some("\x1b[A")
        );
        assert_eq!(key_event_to_input(&key(KeyCode::F(20), KeyModifiers::NONE)), None);
    }

    #[test]
    fn alt_prefixes_escape() {
        let alt_b = key(KeyCode::Char('b'), KeyModifiers::ALT);
        assert_eq!(key_event_to_input(&alt_b).as_deref(), Some("\x1bb"));
    }

    #[test]
    fn detach_key_is_ctrl_bracket() {
        assert!(is_detach_key(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)));
        assert!(!is_detach_key(&key(KeyCode::Char(']'), KeyModifiers::NONE)));
    }
}
