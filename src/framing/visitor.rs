//! Callback-driven decoding of a tagged-union stream.
//!
//! A [`StreamVisitor`] is built once from a message's descriptor and a set of
//! callbacks keyed by field number. Building it checks that every field
//! reachable from the start position has a callback, so a consumer that forgets
//! to handle a message fails at construction rather than mid-stream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;

use crate::error::{Code, Status};
use crate::framing::{FieldDescriptor, Oneof, Variant};
use crate::rpc::FrameStream;

type Callback<C, M> =
    Box<dyn for<'c> Fn(&'c mut C, M) -> BoxFuture<'c, Result<(), Status>> + Send + Sync>;

type EofCallback<C> =
    Box<dyn for<'c> Fn(&'c mut C) -> BoxFuture<'c, Result<(), Status>> + Send + Sync>;

/// Construction-time errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VisitorError {
    #[error("message {message} must have exactly one oneof, found {count}")]
    OneofCount { message: &'static str, count: usize },

    #[error("oneof {oneof} does not have a field {field}")]
    UnknownField { oneof: &'static str, field: u32 },

    #[error("no callback defined for field {0}")]
    MissingCallback(&'static str),

    #[error("more than one callback defined for field {0}")]
    DuplicateCallback(u32),

    #[error("field {0} does not carry data")]
    NoData(u32),
}

fn erase<C, M, F>(f: F) -> Callback<C, M>
where
    F: for<'c> Fn(&'c mut C, M) -> BoxFuture<'c, Result<(), Status>> + Send + Sync + 'static,
{
    Box::new(f)
}

fn mismatched<'c>(expected: u32, got: u32) -> BoxFuture<'c, Result<(), Status>> {
    future::ready(Err(Status::internal(format!(
        "callback for field {expected} invoked with field {got}"
    ))))
    .boxed()
}

pub struct VisitorBuilder<M, C> {
    start: Option<u32>,
    callbacks: Vec<(u32, Callback<C, M>)>,
    not_expected: HashMap<u32, Code>,
    eof: Option<EofCallback<C>>,
    errors: Vec<VisitorError>,
    _message: PhantomData<fn(M)>,
}

impl<M, C> VisitorBuilder<M, C>
where
    M: Oneof,
    C: Send + 'static,
{
    fn new() -> Self {
        Self {
            start: None,
            callbacks: Vec::new(),
            not_expected: HashMap::new(),
            eof: None,
            errors: Vec::new(),
            _message: PhantomData,
        }
    }

    /// Resume mid-protocol: decoding continues as if `field` was the last
    /// message received. Fields unreachable from there need no callback.
    pub fn start_at(mut self, field: u32) -> Self {
        self.start = Some(field);
        self
    }

    /// Fields that must not arrive from here on. Receiving one fails the visit
    /// with `code`. They need no callback.
    pub fn not_expecting(mut self, code: Code, fields: &[u32]) -> Self {
        for &field in fields {
            self.not_expected.insert(field, code);
        }
        self
    }

    /// Callback bound to the payload type of one alternative.
    pub fn on<P, F>(self, f: F) -> Self
    where
        P: Variant<M> + Send + 'static,
        F: for<'c> Fn(&'c mut C, P) -> BoxFuture<'c, Result<(), Status>> + Send + Sync + 'static,
    {
        let callback = erase(move |ctx: &mut C, msg: M| match P::from_message(msg) {
            Ok(payload) => f(ctx, payload),
            Err(other) => mismatched(P::FIELD, other.field_number()),
        });
        self.register(P::FIELD, callback)
    }

    /// Callback bound to the whole message.
    pub fn on_message<F>(self, field: u32, f: F) -> Self
    where
        F: for<'c> Fn(&'c mut C, M) -> BoxFuture<'c, Result<(), Status>> + Send + Sync + 'static,
    {
        self.register(field, erase(f))
    }

    /// Callback bound to the bytes of an alternative whose payload is a
    /// [`DataCarrier`](crate::framing::DataCarrier).
    pub fn on_data<F>(mut self, field: u32, f: F) -> Self
    where
        F: for<'c> Fn(&'c mut C, Bytes) -> BoxFuture<'c, Result<(), Status>>
            + Send
            + Sync
            + 'static,
    {
        if let Some(descriptor) = M::descriptor().field(field) {
            if !descriptor.carries_data {
                self.errors.push(VisitorError::NoData(field));
            }
        }
        let callback = erase(move |ctx: &mut C, msg: M| match msg.into_data() {
            Ok(data) => f(ctx, data),
            Err(other) => mismatched(field, other.field_number()),
        });
        self.register(field, callback)
    }

    pub fn on_eof<F>(mut self, f: F) -> Self
    where
        F: for<'c> Fn(&'c mut C) -> BoxFuture<'c, Result<(), Status>> + Send + Sync + 'static,
    {
        self.eof = Some(Box::new(f));
        self
    }

    fn register(mut self, field: u32, callback: Callback<C, M>) -> Self {
        if self.callbacks.iter().any(|(number, _)| *number == field) {
            self.errors.push(VisitorError::DuplicateCallback(field));
        }
        self.callbacks.push((field, callback));
        self
    }

    pub fn build(self) -> Result<StreamVisitor<M, C>, VisitorError> {
        let descriptor = M::descriptor();
        let oneof = match descriptor.oneofs {
            [oneof] => oneof,
            others => {
                return Err(VisitorError::OneofCount {
                    message: descriptor.name,
                    count: others.len(),
                })
            }
        };
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let fields: HashMap<u32, &'static FieldDescriptor> = oneof
            .fields
            .iter()
            .map(|field| (field.number, field))
            .collect();
        let unknown = |field: u32| VisitorError::UnknownField {
            oneof: oneof.name,
            field,
        };

        let registered = self.callbacks.iter().map(|(number, _)| *number);
        for field in registered
            .chain(self.not_expected.keys().copied())
            .chain(self.start)
        {
            if !fields.contains_key(&field) {
                return Err(unknown(field));
            }
        }

        let initial = match self.start {
            Some(start) => fields[&start].next,
            None => oneof.first,
        };

        let mut reachable = HashSet::new();
        let mut queue: VecDeque<u32> = initial.iter().copied().collect();
        while let Some(number) = queue.pop_front() {
            if self.not_expected.contains_key(&number) || !reachable.insert(number) {
                continue;
            }
            let field = fields.get(&number).ok_or_else(|| unknown(number))?;
            queue.extend(field.next.iter().copied());
        }

        let callbacks: HashMap<u32, Callback<C, M>> = self.callbacks.into_iter().collect();
        let mut missing: Vec<u32> = reachable
            .into_iter()
            .filter(|number| !callbacks.contains_key(number))
            .collect();
        missing.sort_unstable();
        if let Some(number) = missing.first() {
            return Err(VisitorError::MissingCallback(fields[number].name));
        }

        Ok(StreamVisitor {
            initial,
            fields,
            callbacks,
            not_expected: self.not_expected,
            eof: self.eof,
        })
    }
}

/// Validated decoder for streams of `M`, threading a context `C` through the
/// callbacks.
pub struct StreamVisitor<M, C> {
    initial: &'static [u32],
    fields: HashMap<u32, &'static FieldDescriptor>,
    callbacks: HashMap<u32, Callback<C, M>>,
    not_expected: HashMap<u32, Code>,
    eof: Option<EofCallback<C>>,
}

impl<M, C> StreamVisitor<M, C>
where
    M: Oneof,
    C: Send + 'static,
{
    pub fn builder() -> VisitorBuilder<M, C> {
        VisitorBuilder::new()
    }

    /// Reads `stream` to its end, dispatching each message in wire order.
    pub async fn visit(&self, stream: &mut FrameStream<M>, ctx: &mut C) -> Result<(), Status> {
        let mut allowed = self.initial;
        let mut previous: Option<&'static str> = None;
        loop {
            let msg = match stream.recv().await? {
                Some(msg) => msg,
                None => {
                    return match &self.eof {
                        Some(eof) => eof(ctx).await,
                        None => Ok(()),
                    }
                }
            };
            let number = msg.field_number();
            if let Some(code) = self.not_expected.get(&number) {
                return Err(Status::new(
                    *code,
                    format!("unexpected field number received: {number}"),
                ));
            }
            if !allowed.contains(&number) {
                let message = match previous {
                    Some(name) => format!("transition from {name} to field {number} is not allowed"),
                    None => format!("field {number} is not allowed at the start of the stream"),
                };
                return Err(Status::internal(message));
            }
            let field = self
                .fields
                .get(&number)
                .ok_or_else(|| Status::internal(format!("unknown field number {number}")))?;
            let callback = self.callbacks.get(&number).ok_or_else(|| {
                Status::internal(format!("no callback defined for field {}", field.name))
            })?;
            callback(&mut *ctx, msg).await?;
            allowed = field.next;
            previous = Some(field.name);
        }
    }
}
