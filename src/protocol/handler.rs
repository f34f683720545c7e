//! Request processing.
//!
//! A [`RequestHandler`] owns the fixed part of handling a request: decoding its body,
//! isolating failures and counting outcomes. The command specific part is supplied
//! by a [`Processor`], typically one per command family. Processors never see a
//! request whose body failed to decode, and nothing they return or panic with can
//! escape [`RequestHandler::handle`].
use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{error, trace, warn};
use thiserror::Error;

use crate::Command;

use super::{Codec, Origin, Request, RequestQueue};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("'{0}' is not handled here")]
    Unsupported(Command),

    #[error("{0}")]
    Rejected(String),
}

/// Command specific processing logic.
pub trait Processor: Send {
    /// Handle one decoded request, pushing any responses onto `responses`.
    fn process(&mut self, request: &Request, responses: &RequestQueue) -> Result<(), HandlerError>;

    /// Runs after every `process` call that returned, whatever its result.
    fn post_process(&mut self, _request: &Request, _responses: &RequestQueue) {}
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn process(&mut self, request: &Request, responses: &RequestQueue) -> Result<(), HandlerError> {
        (**self).process(request, responses)
    }

    fn post_process(&mut self, request: &Request, responses: &RequestQueue) {
        (**self).post_process(request, responses)
    }
}

/// Builds the processor for each new connection.
pub type HandlerFactory = Arc<dyn Fn(&Origin) -> Box<dyn Processor> + Send + Sync>;

/// Result of one [`RequestHandler::handle`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// The body could not be decoded; the request was discarded.
    Dropped,
    /// `process` returned an error or panicked.
    Failed,
}

#[derive(Debug, Default)]
pub struct HandlerStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl HandlerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Processed => &self.processed,
            Outcome::Dropped => &self.dropped,
            Outcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct RequestHandler<P: Processor = Box<dyn Processor>> {
    codec: Codec,
    processor: P,
    input: RequestQueue,
    output: RequestQueue,
    stats: Arc<HandlerStats>,
}

impl<P: Processor> fmt::Debug for RequestHandler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("codec", &self.codec)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<P: Processor> RequestHandler<P> {
    pub fn new(codec: Codec, processor: P, input: RequestQueue, output: RequestQueue) -> Self {
        Self {
            codec,
            processor,
            input,
            output,
            stats: Arc::new(HandlerStats::new()),
        }
    }

    /// Share outcome counters with other handlers.
    pub fn with_stats(mut self, stats: Arc<HandlerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn input(&self) -> &RequestQueue {
        &self.input
    }

    pub fn output(&self) -> &RequestQueue {
        &self.output
    }

    pub fn stats(&self) -> &Arc<HandlerStats> {
        &self.stats
    }

    /// Decode `request` and pass it to the processor.
    ///
    /// A processor error is answered with a negative `ACK` so the peer is not left
    /// waiting for a reply that will never come.
    pub fn handle(&mut self, mut request: Request) -> Outcome {
        if let Err(e) = request.decode_body(&self.codec) {
            warn!(
                "dropping malformed '{}' request from {}: {e}",
                request.command(),
                origin_of(&request)
            );
            self.stats.record(Outcome::Dropped);
            return Outcome::Dropped;
        }
        trace!("processing '{request}' from {}", origin_of(&request));

        let processor = &mut self.processor;
        let output = &self.output;
        let result = catch_unwind(AssertUnwindSafe(|| {
            let result = processor.process(&request, output);
            processor.post_process(&request, output);
            result
        }));

        let outcome = match result {
            Ok(Ok(())) => Outcome::Processed,
            Ok(Err(e)) => {
                warn!(
                    "failed to process '{}' from {}: {e}",
                    request.command(),
                    origin_of(&request)
                );
                self.output
                    .push(request.reply(Request::ack(false, ack_detail(&e))));
                Outcome::Failed
            }
            Err(panic) => {
                error!(
                    "processor panicked on '{}' from {}: {}",
                    request.command(),
                    origin_of(&request),
                    panic_message(panic.as_ref())
                );
                Outcome::Failed
            }
        };

        self.stats.record(outcome);
        outcome
    }

    /// Handle requests from the input queue until it is closed and drained.
    pub fn run(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(request) = self.input.pop() {
            self.handle(request);
            handled += 1;
        }
        handled
    }
}

fn origin_of(request: &Request) -> String {
    request
        .origin()
        .map(|o| o.to_string())
        .unwrap_or_else(|| "local".to_string())
}

/// Error text as a single line that always fits the trailing `ACK` field.
fn ack_detail(e: &HandlerError) -> String {
    e.to_string()
        .replace(['\r', '\n'], " ")
        .trim_start()
        .to_string()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, thread};

    use super::*;
    use crate::protocol::RawBody;

    /// Records every request it sees and answers `GET` with a fixed value.
    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        post: Arc<AtomicU64>,
    }

    impl Processor for Recorder {
        fn process(&mut self, request: &Request, responses: &RequestQueue) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(request.to_string());
            match request.command() {
                Command::Get => {
                    let key = request.str_at(0).unwrap_or_default();
                    responses.push(request.reply(Request::value(key, 1.0)));
                    Ok(())
                }
                Command::Set if request.str_at(0) == Some("boom") => panic!("boom"),
                Command::Set if request.str_at(0) == Some("multiline") => Err(
                    HandlerError::Rejected("\n  first line\r\nsecond".to_string()),
                ),
                Command::Set => Err(HandlerError::Rejected("read only".to_string())),
                other => Err(HandlerError::Unsupported(other)),
            }
        }

        fn post_process(&mut self, _request: &Request, _responses: &RequestQueue) {
            self.post.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn text(command: Command, body: &str) -> Request {
        Request::inbound(command, RawBody::Text(body.to_string()), None)
    }

    fn handler(recorder: Recorder) -> RequestHandler<Recorder> {
        RequestHandler::new(
            Codec::default(),
            recorder,
            RequestQueue::new(),
            RequestQueue::new(),
        )
    }

    #[test]
    fn processes_decoded_requests() {
        let recorder = Recorder::default();
        let post = Arc::clone(&recorder.post);
        let mut handler = handler(recorder);

        assert_eq!(handler.handle(text(Command::Get, " speed")), Outcome::Processed);
        assert_eq!(handler.output().pop().unwrap(), Request::value("speed", 1.0));
        assert_eq!(post.load(Ordering::Relaxed), 1);
        assert_eq!(handler.stats().processed(), 1);
    }

    #[test]
    fn malformed_requests_never_reach_processor() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let post = Arc::clone(&recorder.post);
        let mut handler = handler(recorder);

        assert_eq!(handler.handle(text(Command::Set, " speed")), Outcome::Dropped);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(post.load(Ordering::Relaxed), 0);
        assert!(handler.output().is_empty());
        assert_eq!(handler.stats().dropped(), 1);
    }

    #[test]
    fn process_errors_are_acknowledged() {
        let recorder = Recorder::default();
        let post = Arc::clone(&recorder.post);
        let mut handler = handler(recorder);

        assert_eq!(handler.handle(Request::set("speed", 2.0)), Outcome::Failed);
        assert_eq!(handler.output().pop().unwrap(), Request::ack(false, "read only"));
        assert_eq!(post.load(Ordering::Relaxed), 1);

        assert_eq!(handler.handle(Request::get("after")), Outcome::Processed);
        assert_eq!(handler.stats().failed(), 1);
        assert_eq!(handler.stats().processed(), 1);
    }

    #[test]
    fn error_acks_are_always_encodable() {
        let mut handler = handler(Recorder::default());

        assert_eq!(handler.handle(Request::set("multiline", 1.0)), Outcome::Failed);
        let ack = handler.output().pop().unwrap();
        assert_eq!(ack, Request::ack(false, "first line  second"));
        assert_eq!(
            Codec::default().encode(&ack).unwrap(),
            b"ACK 0 first line  second\n"
        );
    }

    #[test]
    fn panics_are_contained() {
        let mut handler = handler(Recorder::default());

        assert_eq!(handler.handle(Request::set("boom", 1.0)), Outcome::Failed);
        assert_eq!(handler.handle(Request::get("still-alive")), Outcome::Processed);
        assert_eq!(
            handler.output().drain(),
            vec![Request::value("still-alive", 1.0)]
        );
    }

    #[test]
    fn run_consumes_input_in_order() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let mut handler = handler(recorder);
        let input = handler.input().clone();

        let worker = thread::spawn(move || handler.run());
        for key in ["a", "b", "c"] {
            input.push(Request::get(key));
        }
        input.close();

        assert_eq!(worker.join().unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["GET a", "GET b", "GET c"]);
    }

    #[test]
    fn boxed_processors() {
        let boxed: Box<dyn Processor> = Box::new(Recorder::default());
        let mut handler: RequestHandler =
            RequestHandler::new(Codec::default(), boxed, RequestQueue::new(), RequestQueue::new());

        assert_eq!(handler.handle(Request::pong()), Outcome::Failed);
        assert_eq!(
            handler.output().pop().unwrap(),
            Request::ack(false, "'PONG' is not handled here")
        );
    }
}
