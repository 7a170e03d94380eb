//! Control-socket session: request/response transactions multiplexed with
//! unsolicited device events on one TCP stream.
//!
//! A dedicated reader thread owns the receive side and demultiplexes by
//! (transaction id, magic) against a pending table of single-fire
//! completions. The send side is a mutex-serialized write of one whole
//! frame. Whatever terminates the reader fails every pending waiter with
//! the terminal cause, so no caller ever hangs on a dead socket.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::protocol::{
    self, CONTROL_HEADER_LEN, MAGIC_KEY_STATE_CHANGE, MAX_CONTROL_BODY_LEN,
};
use crate::types::ControlEvent;
use crate::watch::EventBus;
use crate::{Error, Result};

/// Single-fire completions keyed by (transaction id, magic).
///
/// Both the reader (resolve) and the requester (timeout/cancel) may remove
/// an entry; whichever gets there first wins and the other finds nothing.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<(u32, u16), Sender<Result<Vec<u8>>>>>,
}

impl PendingTable {
    pub fn register(&self, tx_id: u32, magic: u16) -> Result<Receiver<Result<Vec<u8>>>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&(tx_id, magic)) {
            return Err(Error::TransactionCollision { tx_id, magic });
        }
        let (tx, rx) = bounded(1);
        entries.insert((tx_id, magic), tx);
        Ok(rx)
    }

    /// Complete a waiter with a response payload. False when no waiter holds
    /// the key.
    pub fn resolve(&self, tx_id: u32, magic: u16, payload: Vec<u8>) -> bool {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(&(tx_id, magic))
        };
        match entry {
            Some(waiter) => {
                let _ = waiter.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, tx_id: u32, magic: u16) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(tx_id, magic));
    }

    /// Fail every registered waiter with the terminal cause. New
    /// registrations remain possible afterwards.
    pub fn fail_all(&self, error: &Error) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().collect()
        };
        for (_, waiter) in drained {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// An open control-socket session.
pub(crate) struct ControlSession {
    writer: Mutex<TcpStream>,
    pending: Arc<PendingTable>,
    next_tx: AtomicU32,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ControlSession {
    /// Take ownership of a connected control socket and start its reader.
    pub fn open(stream: TcpStream, events: Arc<EventBus<ControlEvent>>) -> Result<ControlSession> {
        let _ = stream.set_nodelay(true);
        let reader_stream = stream.try_clone().map_err(Error::io)?;
        let pending = Arc::new(PendingTable::default());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            std::thread::Builder::new()
                .name("xreal-control".into())
                .spawn(move || control_reader_loop(reader_stream, pending, events, closed))
                .map_err(Error::io)?
        };

        Ok(ControlSession {
            writer: Mutex::new(stream),
            pending,
            next_tx: AtomicU32::new(1),
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Whether the session can still carry requests.
    pub fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Strictly positive ids, wrapping from `i32::MAX` back to 1.
    fn alloc_tx_id(&self) -> u32 {
        loop {
            let current = self.next_tx.load(Ordering::Relaxed);
            let next = if current >= i32::MAX as u32 { 1 } else { current + 1 };
            if self
                .next_tx
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }

    /// Issue one request and await its correlated response payload.
    pub fn send_transaction(
        &self,
        magic: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "transaction timeout must be positive".into(),
            ));
        }
        if !self.is_healthy() {
            return Err(Error::ConnectionClosed);
        }

        let tx_id = self.alloc_tx_id();
        let completion = self.pending.register(tx_id, magic)?;

        if let Err(e) = self.write_frame(magic, tx_id, body) {
            self.pending.remove(tx_id, magic);
            return Err(e);
        }

        let outcome = match completion.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            // The sender only disappears with the table entry; treat a
            // vanished one as a closed session.
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        };
        self.pending.remove(tx_id, magic);
        outcome
    }

    fn write_frame(&self, magic: u16, tx_id: u32, body: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(CONTROL_HEADER_LEN + 4 + body.len());
        frame.extend_from_slice(&protocol::encode_control_header(
            magic,
            (body.len() + 4) as u32,
        ));
        frame.extend_from_slice(&protocol::mark_outbound(tx_id).to_be_bytes());
        frame.extend_from_slice(body);

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_healthy() {
            return Err(Error::ConnectionClosed);
        }
        writer
            .write_all(&frame)
            .and_then(|()| writer.flush())
            .map_err(|e| {
                if self.closed.load(Ordering::Acquire) {
                    Error::ConnectionClosed
                } else {
                    Error::io(e)
                }
            })
    }

    /// Tear the session down: further writes fail, the reader unblocks, and
    /// every pending request observes ConnectionClosed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("closing control session");
        {
            let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let _ = writer.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        self.pending.fail_all(&Error::ConnectionClosed);
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receive loop: demultiplex responses to their waiters, publish everything
/// else, and fail all pending work on termination.
fn control_reader_loop(
    mut stream: TcpStream,
    pending: Arc<PendingTable>,
    events: Arc<EventBus<ControlEvent>>,
    closed: Arc<AtomicBool>,
) {
    let classify = |e: std::io::Error, closed: &AtomicBool| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof || closed.load(Ordering::Acquire) {
            Error::ConnectionClosed
        } else {
            Error::io(e)
        }
    };

    let terminal = loop {
        let mut header = [0u8; CONTROL_HEADER_LEN];
        if let Err(e) = stream.read_exact(&mut header) {
            break classify(e, &closed);
        }
        let magic = u16::from_be_bytes([header[0], header[1]]);
        let length = i32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        if length < 0 {
            break Error::protocol(format!("negative control body length {length}"));
        }
        if length as usize > MAX_CONTROL_BODY_LEN {
            break Error::protocol(format!("control body length {length} exceeds limit"));
        }

        let mut body = vec![0u8; length as usize];
        if let Err(e) = stream.read_exact(&mut body) {
            break classify(e, &closed);
        }

        if magic == MAGIC_KEY_STATE_CHANGE {
            match protocol::decode_key_event(&body) {
                Ok(event) => events.publish(ControlEvent::Key(event)),
                Err(e) => {
                    log::warn!("malformed key-state event: {e}");
                    events.publish(ControlEvent::Unknown {
                        magic,
                        payload: body,
                    });
                }
            }
            continue;
        }

        if body.len() < 4 {
            events.publish(ControlEvent::Unknown {
                magic,
                payload: body,
            });
            continue;
        }
        let wire = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let tx_id = protocol::normalize_tx_id(wire);
        let payload = body[4..].to_vec();
        if !pending.resolve(tx_id, magic, payload) {
            log::debug!("inbound frame matched no pending transaction (magic 0x{magic:04x}, tx {tx_id})");
            events.publish(ControlEvent::Unknown {
                magic,
                payload: body,
            });
        }
    };

    log::info!("control reader terminating: {terminal}");
    closed.store(true, Ordering::Release);
    pending.fail_all(&terminal);
}
