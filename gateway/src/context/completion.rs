//! 响应完成（finalize）
//!
//! 日志不是通过替换框架的方法实现的，而是用装饰器包装 [`Finalize`]：
//! [`InstrumentedFinalize`] 记录日志后总是把同样的调用转发给内层实现，
//! [`CompletionGuard`] 保证每个请求恰好完成一次（包括客户端断开时），
//! [`CompletionBody`] 把完成时机推迟到响应数据全部交给连接之后

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use http_body::{Body as HttpBody, Frame, SizeHint};
use parking_lot::Mutex;
use tracing::debug;

use super::RequestContext;
use super::log::{LogSink, RequestLogRecord};

/// 响应的可观测部分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOutcome {
    /// 客户端提前断开时为 `None`
    pub status: Option<u16>,
    /// 原始 content-length 头
    pub content_length: Option<HeaderValue>,
}

impl ResponseOutcome {
    pub fn from_response(response: &Response) -> Self {
        Self {
            status: Some(response.status().as_u16()),
            content_length: response.headers().get(header::CONTENT_LENGTH).cloned(),
        }
    }

    /// 请求未完成时的状态
    pub fn disconnected() -> Self {
        Self {
            status: None,
            content_length: None,
        }
    }
}

/// 响应的 content-encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEncoding(pub String);

impl ContentEncoding {
    pub fn identity() -> Self {
        Self("identity".to_string())
    }
}

/// 响应完成回调
///
/// 处理器可以把它放进响应扩展中；无论克隆多少份，只会执行一次
#[derive(Clone)]
pub struct CompletionCallback {
    inner: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl CompletionCallback {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// 执行回调；已执行过则什么也不做
    pub fn fire(&self) {
        let callback = self.inner.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCallback").finish_non_exhaustive()
    }
}

/// finalize 支持的调用形式
#[derive(Debug, Clone)]
pub enum FinalizeCall {
    Body(ResponseOutcome),
    BodyWithEncoding(ResponseOutcome, ContentEncoding),
    BodyWithEncodingAndCallback(ResponseOutcome, ContentEncoding, CompletionCallback),
}

impl FinalizeCall {
    /// 根据响应选择调用形式
    ///
    /// 响应扩展中的 [`CompletionCallback`] 会被取出
    pub fn from_response(response: &mut Response) -> Self {
        let outcome = ResponseOutcome::from_response(response);
        let encoding = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| ContentEncoding(v.to_string()));
        let callback = response.extensions_mut().remove::<CompletionCallback>();

        match (encoding, callback) {
            (encoding, Some(callback)) => Self::BodyWithEncodingAndCallback(
                outcome,
                encoding.unwrap_or_else(ContentEncoding::identity),
                callback,
            ),
            (Some(encoding), None) => Self::BodyWithEncoding(outcome, encoding),
            (None, None) => Self::Body(outcome),
        }
    }

    /// 保留调用形式，状态换成断开
    pub fn disconnected(self) -> Self {
        let outcome = ResponseOutcome::disconnected();
        match self {
            Self::Body(_) => Self::Body(outcome),
            Self::BodyWithEncoding(_, encoding) => Self::BodyWithEncoding(outcome, encoding),
            Self::BodyWithEncodingAndCallback(_, encoding, callback) => {
                Self::BodyWithEncodingAndCallback(outcome, encoding, callback)
            }
        }
    }

    pub fn outcome(&self) -> &ResponseOutcome {
        match self {
            Self::Body(outcome)
            | Self::BodyWithEncoding(outcome, _)
            | Self::BodyWithEncodingAndCallback(outcome, _, _) => outcome,
        }
    }
}

/// 响应完成操作
pub trait Finalize: Send {
    fn finalize(&mut self, call: FinalizeCall);
}

/// 宿主的 finalize：响应数据已全部交出，执行回调
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFinalize;

impl Finalize for HostFinalize {
    fn finalize(&mut self, call: FinalizeCall) {
        debug!(status = call.outcome().status, "Response finalized");
        if let FinalizeCall::BodyWithEncodingAndCallback(_, _, callback) = call {
            callback.fire();
        }
    }
}

/// 带日志的 finalize 装饰器
pub struct InstrumentedFinalize<F> {
    inner: F,
    sink: Arc<dyn LogSink>,
    context: Arc<RequestContext>,
    user_agent: Option<String>,
}

impl<F: Finalize> InstrumentedFinalize<F> {
    pub fn new(
        inner: F,
        sink: Arc<dyn LogSink>,
        context: Arc<RequestContext>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            inner,
            sink,
            context,
            user_agent,
        }
    }

    fn duration_ms(&self, now: Instant) -> u64 {
        u64::try_from(now.duration_since(self.context.started_at).as_millis()).unwrap_or(u64::MAX)
    }
}

impl<F: Finalize> Finalize for InstrumentedFinalize<F> {
    fn finalize(&mut self, call: FinalizeCall) {
        let duration_ms = self.duration_ms(Instant::now());

        match RequestLogRecord::build(
            &self.context,
            self.user_agent.as_deref(),
            call.outcome(),
            duration_ms,
        ) {
            Ok(record) => self.sink.emit(&record),
            Err(e) => self.sink.emit_failure(&self.context.request_id, &e),
        }

        self.inner.finalize(call);
    }
}

/// 保证 finalize 恰好执行一次
///
/// 正常路径调用 [`CompletionGuard::complete`]；若请求 future 在完成前被丢弃，
/// 则在 drop 时以 [`ResponseOutcome::disconnected`] 完成
pub struct CompletionGuard<F: Finalize> {
    finalize: Option<F>,
}

impl<F: Finalize> CompletionGuard<F> {
    pub fn new(finalize: F) -> Self {
        Self {
            finalize: Some(finalize),
        }
    }

    pub fn complete(mut self, call: FinalizeCall) {
        if let Some(mut finalize) = self.finalize.take() {
            finalize.finalize(call);
        }
    }
}

impl<F: Finalize> Drop for CompletionGuard<F> {
    fn drop(&mut self) {
        if let Some(mut finalize) = self.finalize.take() {
            finalize.finalize(FinalizeCall::Body(ResponseOutcome::disconnected()));
        }
    }
}

/// 在数据流结束时完成的响应 body
///
/// 读到流末尾时以响应头对应的调用完成；数据未发完就被丢弃
/// （客户端断开或 body 出错）时以同样的调用形式、断开状态完成，回调照常执行
pub struct CompletionBody<F: Finalize> {
    inner: Body,
    pending: Option<(CompletionGuard<F>, FinalizeCall)>,
}

impl<F: Finalize> CompletionBody<F> {
    pub fn new(inner: Body, guard: CompletionGuard<F>, call: FinalizeCall) -> Self {
        Self {
            inner,
            pending: Some((guard, call)),
        }
    }

    fn complete(&mut self) {
        if let Some((guard, call)) = self.pending.take() {
            guard.complete(call);
        }
    }

    fn abort(&mut self) {
        if let Some((guard, call)) = self.pending.take() {
            guard.complete(call.disconnected());
        }
    }
}

impl<F: Finalize + Unpin> HttpBody for CompletionBody<F> {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.complete(),
            Poll::Ready(Some(Err(_))) => this.abort(),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<F: Finalize> Drop for CompletionBody<F> {
    fn drop(&mut self) {
        // 空 body 可能不会被轮询到末尾
        if self.inner.is_end_stream() {
            self.complete();
        } else {
            self.abort();
        }
    }
}
