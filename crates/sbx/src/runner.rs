//! Isolate runner: executes one [`ExecutionRequest`] in a fresh V8 isolate and
//! produces the sanitized [`ExecutionReply`].
//!
//! States: `Spawned → ContextBuilt → Running → Settling → Done`.
//!
//! V8 isolates are `!Send`, so the runtime lives on a dedicated thread with
//! its own single-threaded tokio runtime ([`run_isolate_blocking`]). Every
//! failure inside the isolate becomes a reply; nothing here returns an error.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::task::Poll;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};

use crate::capabilities::{CapabilityRegistry, OutputSink};
use crate::graph::Graph;
use crate::ipc::WorkerConfig;
use crate::modules::ModuleLoader;
use crate::ops::{sbx_ext, ContextSnapshot, ExitRequest, SettleState, TerminationHandle};
use crate::reply::{ExceptionInfo, ExecutionReply, ExecutionRequest};
use crate::sanitize::{CircularReplacer, Sanitizer};

const BOOTSTRAP_JS: &str = include_str!("js/bootstrap.js");

/// Upper bound on the time allowed for capturing the context after the run.
/// The orchestrator's guard margin must leave room for it.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a run did not complete normally, before priority is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RunStatus {
    Completed,
    ScriptError(String),
    TimedOut,
    NeverSettled,
    UnwrapDepth(usize),
}

/// Run `request` on a dedicated thread and wait for the reply.
pub fn run_isolate_blocking(request: ExecutionRequest, config: WorkerConfig) -> ExecutionReply {
    let spawned = std::thread::Builder::new()
        .name("sbx-isolate".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| format!("failed to create tokio runtime: {e}"))?;
            Ok::<_, String>(rt.block_on(run_isolate(&request, &config)))
        });

    let outcome = match spawned {
        Ok(handle) => handle
            .join()
            .unwrap_or_else(|_| Err("isolate thread panicked".to_string())),
        Err(e) => Err(format!("failed to spawn isolate thread: {e}")),
    };

    outcome.unwrap_or_else(|message| {
        tracing::error!(error = %message, "isolate did not produce a reply");
        ExecutionReply::failed(ExceptionInfo::transport(message))
    })
}

/// Run `request` in a fresh isolate on the current thread.
///
/// Must be called from a single-threaded tokio runtime on a thread that owns
/// nothing else V8 related.
pub async fn run_isolate(request: &ExecutionRequest, config: &WorkerConfig) -> ExecutionReply {
    tracing::debug!(state = "spawned", "isolate starting");
    let sink = OutputSink::new();

    let mut isolate = match Isolate::new(config) {
        Ok(isolate) => isolate,
        Err(e) => return host_failure(&sink, format!("failed to start isolate: {e:#}")),
    };
    if let Err(e) = isolate.build_context(request, config, &sink) {
        return host_failure(&sink, format!("failed to build sandbox context: {e:#}"));
    }
    tracing::debug!(state = "context_built", lockdown = request.lockdown, "context ready");

    let deadline = request
        .timeout
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let watchdog = deadline.map(|d| Watchdog::arm(isolate.handle(), d));

    tracing::debug!(state = "running", timeout_ms = ?request.timeout, "executing unit");
    let status = isolate
        .run(&request.source, deadline, config.max_unwrap_depth)
        .await;
    let watchdog_fired = watchdog.map(Watchdog::disarm).unwrap_or(false);

    let reply = isolate.finish(request, config, &sink, status, watchdog_fired);
    tracing::debug!(
        state = "done",
        success = reply.succeeded(),
        stdout_lines = reply.stdout.len(),
        "isolate finished"
    );
    reply
}

fn host_failure(sink: &OutputSink, message: String) -> ExecutionReply {
    tracing::warn!(error = %message, "isolate setup failed");
    let mut reply = ExecutionReply::failed(ExceptionInfo::transport(message));
    reply.stdout = sink.take();
    reply
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. Uses AtomicBool so the callback
    /// can use a shared `&` reference instead of `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed inside `Isolate`,
    // which is declared after (and so dropped after) the runtime that owns
    // this callback. The state is only accessed through atomics.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// CPU watchdog: terminates the isolate if the deadline passes first.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn arm(handle: v8::IsolateHandle, deadline: Instant) -> Self {
        let (cancel, cancel_rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let thread = std::thread::spawn(move || {
            let wait = deadline.saturating_duration_since(Instant::now());
            if let Err(mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(wait) {
                flag.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self {
            cancel,
            fired,
            thread,
        }
    }

    /// Stop the watchdog and report whether it fired.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
        self.fired.load(Ordering::SeqCst)
    }
}

/// One fresh runtime plus the state its callbacks point into.
///
/// `internal` is declared first so its handle is released before the runtime.
struct Isolate {
    internal: v8::Global<v8::Object>,
    runtime: JsRuntime,
    heap: Box<HeapLimitState>,
}

impl Isolate {
    fn new(config: &WorkerConfig) -> anyhow::Result<Self> {
        let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![sbx_ext::init_ops_and_esm()],
            create_params: Some(create_params),
            ..Default::default()
        });

        let heap = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap as *const HeapLimitState as *mut std::ffi::c_void,
        );

        let handle = runtime.v8_isolate().thread_safe_handle();
        runtime.op_state().borrow_mut().put(TerminationHandle(handle));

        let completion = runtime
            .execute_script("[sbx:bootstrap]", BOOTSTRAP_JS)
            .map_err(|e| anyhow::anyhow!("bootstrap failed: {e}"))?;
        let internal = {
            let scope = &mut runtime.handle_scope();
            let value = v8::Local::new(scope, completion);
            let object = v8::Local::<v8::Object>::try_from(value)
                .map_err(|_| anyhow::anyhow!("bootstrap did not return its internal surface"))?;
            v8::Global::new(scope, object)
        };

        Ok(Self {
            internal,
            runtime,
            heap,
        })
    }

    fn handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    fn script(&mut self, name: &'static str, code: String) -> anyhow::Result<()> {
        self.runtime
            .execute_script(name, code)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("{e}"))
    }

    /// Call a method of the internal surface through the handle kept from
    /// bootstrap. Works after `seal()` removed the global name.
    fn call(&mut self, method: &str) -> anyhow::Result<()> {
        let scope = &mut self.runtime.handle_scope();
        let internal = v8::Local::new(scope, &self.internal);
        let key = v8::String::new(scope, method)
            .ok_or_else(|| anyhow::anyhow!("failed to allocate method name '{method}'"))?;
        let function = internal
            .get(scope, key.into())
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| anyhow::anyhow!("internal surface has no method '{method}'"))?;

        let tc = &mut v8::TryCatch::new(scope);
        if function.call(tc, internal.into(), &[]).is_some() {
            return Ok(());
        }
        if tc.has_terminated() {
            anyhow::bail!("execution terminated");
        }
        match tc.exception() {
            Some(exception) => anyhow::bail!("{}", JsError::from_v8_exception(tc, exception)),
            None => anyhow::bail!("internal call '{method}' failed"),
        }
    }

    /// Reserved slots, capabilities, caller variables, then the escape hatch.
    fn build_context(
        &mut self,
        request: &ExecutionRequest,
        config: &WorkerConfig,
        sink: &OutputSink,
    ) -> anyhow::Result<()> {
        self.script("[sbx:context]", "__sbx_internal.reserve();".to_string())?;
        CapabilityRegistry::build(sink.clone()).install(&mut self.runtime)?;

        let vars = serde_json::to_string(&serde_json::to_string(&request.context)?)?;
        self.script(
            "[sbx:context]",
            format!("__sbx_internal.inject(JSON.parse({vars}));"),
        )?;

        if !request.lockdown {
            let loader = ModuleLoader::new(&config.module_paths, config.max_modules);
            let modules = loader.load(&request.requires)?;
            tracing::debug!(
                requested = request.requires.len(),
                loaded = modules.modules.len(),
                "escape hatch enabled"
            );
            modules.install(&mut self.runtime)?;
        }
        self.call("seal")
    }

    async fn run(
        &mut self,
        source: &str,
        deadline: Option<Instant>,
        max_unwrap_depth: usize,
    ) -> RunStatus {
        if let Err(e) = self.runtime.execute_script("[sbx:execute]", source.to_string()) {
            return RunStatus::ScriptError(e.to_string());
        }

        tracing::debug!(state = "settling", "waiting for result");
        let mut levels = 0;
        loop {
            match self.settle_step() {
                Err(e) => return RunStatus::ScriptError(e.to_string()),
                Ok(SettleState::Done) => return RunStatus::Completed,
                Ok(SettleState::Settled) => {}
                Ok(SettleState::Pending) => match self.drive(deadline).await {
                    Drive::Settled => {}
                    Drive::Idle => return RunStatus::NeverSettled,
                    Drive::TimedOut => return RunStatus::TimedOut,
                    Drive::Failed(e) => return RunStatus::ScriptError(e),
                },
            }
            levels += 1;
            if levels >= max_unwrap_depth {
                return match self.settle_step() {
                    Ok(SettleState::Done) => RunStatus::Completed,
                    Ok(_) => RunStatus::UnwrapDepth(max_unwrap_depth),
                    Err(e) => RunStatus::ScriptError(e.to_string()),
                };
            }
        }
    }

    /// Inspect `_result` once; attaches settle handlers when it is thenable.
    fn settle_step(&mut self) -> anyhow::Result<SettleState> {
        self.runtime.op_state().borrow_mut().put(SettleState::Done);
        self.call("settle")?;
        Ok(settle_state(&mut self.runtime))
    }

    /// Drive the event loop until the pending result settles.
    async fn drive(&mut self, deadline: Option<Instant>) -> Drive {
        let runtime = &mut self.runtime;
        let poll = poll_fn(|cx| {
            match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
                Poll::Ready(Err(e)) => Poll::Ready(Drive::Failed(e.to_string())),
                Poll::Ready(Ok(())) => Poll::Ready(match settle_state(runtime) {
                    SettleState::Pending => Drive::Idle,
                    _ => Drive::Settled,
                }),
                Poll::Pending => match settle_state(runtime) {
                    SettleState::Pending => Poll::Pending,
                    _ => Poll::Ready(Drive::Settled),
                },
            }
        });
        match deadline {
            Some(d) => tokio::time::timeout_at(tokio::time::Instant::from_std(d), poll)
                .await
                .unwrap_or(Drive::TimedOut),
            None => poll.await,
        }
    }

    /// Apply failure priority, capture and sanitize the context.
    fn finish(
        mut self,
        request: &ExecutionRequest,
        config: &WorkerConfig,
        sink: &OutputSink,
        status: RunStatus,
        watchdog_fired: bool,
    ) -> ExecutionReply {
        self.runtime.v8_isolate().cancel_terminate_execution();

        let exit = self.runtime.op_state().borrow().try_borrow::<ExitRequest>().copied();
        let heap_hit = self.heap.triggered.load(Ordering::SeqCst);
        let timed_out = watchdog_fired || status == RunStatus::TimedOut;

        let mut failure = match (exit, &status) {
            (Some(ExitRequest(0)), _) => None,
            (Some(ExitRequest(code)), _) => Some(ExceptionInfo::vm(format!(
                "process.exit called with code {code}"
            ))),
            (None, _) if heap_hit => Some(ExceptionInfo::transport("heap limit exceeded")),
            (None, _) if timed_out => Some(ExceptionInfo::transport(format!(
                "Script execution timed out after {}ms",
                request.timeout.unwrap_or_default()
            ))),
            (None, RunStatus::ScriptError(e)) => Some(ExceptionInfo::transport_from_engine(e)),
            (None, RunStatus::NeverSettled) => {
                Some(ExceptionInfo::transport("result promise never settled"))
            }
            (None, RunStatus::UnwrapDepth(n)) => Some(ExceptionInfo::transport(format!(
                "result still pending after {n} unwrap levels"
            ))),
            (None, RunStatus::Completed | RunStatus::TimedOut) => None,
        };
        if let Some(f) = &failure {
            tracing::debug!(scope = %f.scope, message = %f.message, "execution failed");
        }

        let mut reply = if heap_hit && exit.is_none() {
            ExecutionReply::default()
        } else {
            match self.snapshot(Duration::from_millis(config.snapshot_timeout_ms)) {
                Ok(graph) => {
                    let sanitizer = Sanitizer::default()
                        .with_modules(&request.modules)
                        .with_replacer(CircularReplacer::Marker(config.circular_marker.clone()))
                        .with_budget(config.max_ipc_message_size);
                    match sanitizer.sanitize(&graph) {
                        Ok(context) => ExecutionReply::from_context(context),
                        Err(e) => {
                            tracing::warn!(limit = e.limit, nodes = graph.len(), "context too large");
                            failure.get_or_insert_with(|| ExceptionInfo::transport(e.to_string()));
                            ExecutionReply::default()
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "context snapshot failed");
                    failure.get_or_insert_with(|| {
                        ExceptionInfo::transport(format!("context could not be captured: {e}"))
                    });
                    ExecutionReply::default()
                }
            }
        };

        reply.stdout = sink.take();
        if failure.is_some() {
            reply.exception = failure;
        }
        reply
    }

    fn snapshot(&mut self, limit: Duration) -> anyhow::Result<Graph> {
        let handle = self.handle();
        let watchdog = Watchdog::arm(handle, Instant::now() + limit);
        let result = self.call("snapshot");
        let fired = watchdog.disarm();
        self.runtime.v8_isolate().cancel_terminate_execution();
        if fired {
            anyhow::bail!("snapshot timed out after {}ms", limit.as_millis());
        }
        result?;

        let json = self
            .runtime
            .op_state()
            .borrow_mut()
            .try_take::<ContextSnapshot>()
            .map(|s| s.0)
            .ok_or_else(|| anyhow::anyhow!("snapshot produced no data"))?;
        Ok(serde_json::from_str(&json)?)
    }
}

enum Drive {
    Settled,
    Idle,
    TimedOut,
    Failed(String),
}

fn settle_state(runtime: &mut JsRuntime) -> SettleState {
    runtime
        .op_state()
        .borrow()
        .try_borrow::<SettleState>()
        .copied()
        .unwrap_or(SettleState::Done)
}
