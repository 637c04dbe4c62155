//! Best-effort email notifications.
//!
//! State-change notifications run on a short-lived thread so they never sit
//! on the restaging path. Delivery is through the [`Mailer`] trait; the
//! default just logs, the sendmail flavor shells out to `mail(1)`.

use std::io::Write;
use std::process::{Command, Stdio};

use log::{info, warn};

/// Delivery backend for notifications.
pub trait Mailer: Send + Sync {
    fn send(&self, from: &str, to: &[String], subject: &str, body: &str);
}

/// Default mailer: writes the notification to the log.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, _from: &str, to: &[String], subject: &str, body: &str) {
        info!(
            "email notification (to {}): {subject}: {body}",
            if to.is_empty() {
                "<nobody>".to_string()
            } else {
                to.join(", ")
            }
        );
    }
}

/// Mailer that pipes the body through the system `mail` command.
#[derive(Debug, Default)]
pub struct SendmailMailer;

impl Mailer for SendmailMailer {
    fn send(&self, from: &str, to: &[String], subject: &str, body: &str) {
        if to.is_empty() {
            warn!("email notification dropped: no recipients configured");
            return;
        }

        let mut cmd = Command::new("mail");
        cmd.arg("-s").arg(subject);
        if !from.is_empty() {
            cmd.arg("-r").arg(from);
        }
        cmd.args(to);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match cmd.spawn() {
            Ok(mut child) => {
                if let Some(stdin) = child.stdin.as_mut() {
                    let _ = stdin.write_all(body.as_bytes());
                }
                match child.wait() {
                    Ok(status) if status.success() => {}
                    Ok(status) => warn!("mail command exited with {status}"),
                    Err(e) => warn!("mail command failed: {e}"),
                }
            }
            Err(e) => warn!("unable to spawn mail command: {e}"),
        }
    }
}

/// Fire a one-shot notification off the critical path. The thread is
/// detached; delivery failures are logged by the mailer and otherwise
/// ignored.
pub fn spawn_emailer(
    mailer: std::sync::Arc<dyn Mailer>,
    from: String,
    to: Vec<String>,
    subject: String,
    body: String,
) {
    let result = std::thread::Builder::new()
        .name("bard-emailer".to_string())
        .spawn(move || {
            mailer.send(&from, &to, &subject, &body);
        });
    if let Err(e) = result {
        warn!("unable to spawn emailer thread: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct CaptureMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Mailer for CaptureMailer {
        fn send(&self, _from: &str, _to: &[String], subject: &str, body: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
        }
    }

    #[test]
    fn emailer_runs_detached() {
        let mailer = Arc::new(CaptureMailer {
            sent: Mutex::new(Vec::new()),
        });
        spawn_emailer(
            mailer.clone(),
            "bard@node".into(),
            vec!["ops@example.com".into()],
            "link restage0 state change".into(),
            "state is now full_disk".into(),
        );

        // best-effort: poll briefly for the detached thread
        for _ in 0..100 {
            if !mailer.sent.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("restage0"));
    }
}
