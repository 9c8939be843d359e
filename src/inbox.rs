//! Latest-only hand-off of edited script text to the frame loop.
//!
//! An editor may send on every keystroke; the runtime only ever wants the
//! newest text when it next ticks, so the channel holds at most one script
//! and a send replaces whatever is still pending.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

#[derive(Clone)]
pub struct ScriptSender {
    tx: Sender<String>,
    drop_rx: Receiver<String>,
}

pub struct ScriptInbox {
    rx: Receiver<String>,
}

pub fn script_channel() -> (ScriptSender, ScriptInbox) {
    let (tx, rx) = bounded(1);
    (
        ScriptSender {
            tx,
            drop_rx: rx.clone(),
        },
        ScriptInbox { rx },
    )
}

impl ScriptSender {
    /// Queue `script`, discarding any script the runtime hasn't picked up yet.
    pub fn send(&self, script: impl Into<String>) {
        if let Err(TrySendError::Full(script)) = self.tx.try_send(script.into()) {
            while self.drop_rx.try_recv().is_ok() {}
            let _ = self.tx.try_send(script);
        }
    }
}

impl ScriptInbox {
    /// The newest pending script, if any arrived since the last call.
    pub fn take_latest(&self) -> Option<String> {
        let mut latest = None;
        while let Ok(script) = self.rx.try_recv() {
            latest = Some(script);
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_newest_script_is_delivered() {
        let (tx, inbox) = script_channel();
        tx.send("a");
        tx.send("b");
        tx.send("c");
        assert_eq!(inbox.take_latest().as_deref(), Some("c"));
        assert_eq!(inbox.take_latest(), None);
    }

    #[test]
    fn senders_work_across_threads() {
        let (tx, inbox) = script_channel();
        let handle = std::thread::spawn(move || {
            for i in 0..50 {
                tx.send(format!("edit {i}"));
            }
        });
        handle.join().unwrap();
        assert_eq!(inbox.take_latest().as_deref(), Some("edit 49"));
    }
}
