//! Minimal inference server speaking protocol v1.
//!
//! Each connection gets a reader thread; each `Evaluate` call is answered
//! from its own thread, so slow calls do not hold back fast ones and
//! replies may leave out of order. Used by the `mz dummy-infer` command and
//! by tests.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::codec::{decode_batch_request, decode_message, encode_message, results_value, Value};
use crate::frame::{read_frame, write_frame, FrameError};
use crate::protocol::{BatchRequest, EvaluationResult, MsgKind};

/// Scores one batch. An `Err` is sent back as an `Error` reply and fails the
/// whole call on the client side.
pub trait BatchHandler:
    Fn(&BatchRequest) -> Result<Vec<EvaluationResult>, String> + Send + Sync + 'static
{
}

impl<F> BatchHandler for F where
    F: Fn(&BatchRequest) -> Result<Vec<EvaluationResult>, String> + Send + Sync + 'static
{
}

/// Accept connections forever.
pub fn serve<H>(listener: TcpListener, handler: H) -> io::Result<()>
where
    H: Fn(&BatchRequest) -> Result<Vec<EvaluationResult>, String> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    for conn in listener.incoming() {
        let stream = match conn {
            Ok(s) => s,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let h = Arc::clone(&handler);
        thread::Builder::new()
            .name("mz-infer-conn".to_string())
            .spawn(move || {
                if let Err(e) = serve_connection(stream, h) {
                    log::debug!("connection closed: {e}");
                }
            })?;
    }
    Ok(())
}

/// Bind `addr`, serve in a background thread, and return the bound address.
pub fn spawn<H>(addr: &str, handler: H) -> io::Result<SocketAddr>
where
    H: Fn(&BatchRequest) -> Result<Vec<EvaluationResult>, String> + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    thread::Builder::new()
        .name("mz-infer-server".to_string())
        .spawn(move || {
            if let Err(e) = serve(listener, handler) {
                log::error!("inference server stopped: {e}");
            }
        })?;
    Ok(local)
}

fn serve_connection<H: BatchHandler>(stream: TcpStream, handler: Arc<H>) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    let mut reader = stream.try_clone()?;
    let writer = Arc::new(Mutex::new(stream));
    loop {
        let payload = match read_frame(&mut reader) {
            Ok(p) => p,
            Err(FrameError::Closed) => return Ok(()),
            Err(FrameError::Io(e)) => return Err(e),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        };
        let msg = match decode_message(&payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                continue;
            }
        };
        match msg.kind {
            MsgKind::Health => {
                reply(&writer, &encode_message(MsgKind::HealthOk, msg.call_id, None))?;
            }
            MsgKind::Evaluate => {
                let h = Arc::clone(&handler);
                let w = Arc::clone(&writer);
                let call_id = msg.call_id;
                let body = msg.body;
                thread::spawn(move || {
                    let out = answer(h.as_ref(), call_id, body.as_ref());
                    if let Err(e) = reply(&w, &out) {
                        log::debug!("call {call_id}: reply failed: {e}");
                    }
                });
            }
            other => {
                let err = Value::Str(format!("unexpected message kind {other:?}"));
                reply(&writer, &encode_message(MsgKind::Error, msg.call_id, Some(&err)))?;
            }
        }
    }
}

fn answer<H: BatchHandler>(handler: &H, call_id: u64, body: Option<&Value>) -> Vec<u8> {
    let batch = match body.map(decode_batch_request) {
        Some(Ok(b)) => b,
        Some(Err(e)) => return error_reply(call_id, e.to_string()),
        None => return error_reply(call_id, "missing request body".to_string()),
    };
    match handler(&batch) {
        Ok(results) if results.len() == batch.len() => {
            let body = results_value(&results, batch.len() != 1);
            encode_message(MsgKind::Result, call_id, Some(&body))
        }
        Ok(results) => error_reply(
            call_id,
            format!("handler returned {} results for {} samples", results.len(), batch.len()),
        ),
        Err(msg) => error_reply(call_id, msg),
    }
}

fn error_reply(call_id: u64, msg: String) -> Vec<u8> {
    encode_message(MsgKind::Error, call_id, Some(&Value::Str(msg)))
}

fn reply(writer: &Mutex<TcpStream>, payload: &[u8]) -> io::Result<()> {
    let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
    match write_frame(&mut *w, payload) {
        Ok(()) => Ok(()),
        Err(FrameError::Io(e)) => Err(e),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

/// Deterministic stand-in for a model: value and logits derived from the
/// feature indices.
pub fn hash_handler(batch: &BatchRequest) -> Result<Vec<EvaluationResult>, String> {
    let mut out = Vec::with_capacity(batch.len());
    for i in 0..batch.len() {
        let sample = batch
            .sample(i)
            .ok_or_else(|| format!("malformed offsets at sample {i}"))?;
        let h = sample
            .iter()
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, &x| {
                (acc ^ x as u64).wrapping_mul(0x0000_0100_0000_01b3)
            });
        let value = ((h % 2001) as f32 / 1000.0) - 1.0;
        let logits: Vec<f32> = (0..64u64)
            .map(|k| ((h.rotate_left(k as u32) % 97) as f32) / 97.0)
            .collect();
        out.push(EvaluationResult {
            value,
            policy_player: Some(logits.clone()),
            policy_opponent: Some(logits.iter().rev().copied().collect()),
            policy_target: Some(logits.clone()),
            policy_binary: Some(vec![logits[0], logits[1]]),
        });
    }
    Ok(out)
}
