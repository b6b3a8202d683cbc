//! Embedded script runtime.
//!
//! Each execution gets a fresh [`rhai::Engine`] with size caps derived from
//! the memory limit and a progress hook that enforces the deadline and
//! cancellation. Host functions are the only way a script touches the
//! filesystem or the network, and every one of them goes through the policy
//! checks here. Policy violations terminate the script; `try`/`catch` cannot
//! swallow them.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rhai::{Array, Dynamic, Engine, EvalAltResult, Position, Scope};

use super::artifacts::walk_files;
use super::fs_policy::FsPolicy;
use super::Variables;
use crate::error::SandboxError;
use crate::limits::ResourceLimits;

/// Captured output is capped at this many bytes.
pub const OUTPUT_LIMIT: usize = 1024 * 1024;
const TRUNCATED_MARKER: &str = "\n[output truncated]\n";

const DEADLINE_CHECK_EVERY: u64 = 256;
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Why a script was stopped from the outside.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    Timeout,
    Cancelled,
    PermissionDenied(String),
}

#[derive(Debug, Default)]
struct OutputBuffer {
    text: String,
    truncated: bool,
}

/// State shared between the async side of the executor and the worker
/// thread running the script.
#[derive(Debug, Default)]
pub struct Signals {
    cancelled: AtomicBool,
    interrupt: Mutex<Option<Interrupt>>,
    output: Mutex<OutputBuffer>,
}

impl Signals {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Record why the script stopped. The first cause wins.
    pub fn interrupt(&self, cause: Interrupt) {
        let mut slot = self.interrupt.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(cause);
        }
    }

    pub fn recorded_interrupt(&self) -> Option<Interrupt> {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn append_line(&self, line: &str) {
        let mut buf = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if buf.truncated {
            return;
        }
        let room = OUTPUT_LIMIT.saturating_sub(buf.text.len());
        if line.len() + 1 <= room {
            buf.text.push_str(line);
            buf.text.push('\n');
            return;
        }
        let mut cut = room.min(line.len());
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        buf.text.push_str(&line[..cut]);
        buf.text.push_str(TRUNCATED_MARKER);
        buf.truncated = true;
    }

    pub fn output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text
            .clone()
    }
}

/// Run `code` with `seed` bound as mutable variables and return the final
/// bindings on success.
pub fn run_script(
    code: &str,
    seed: &Variables,
    limits: &ResourceLimits,
    policy: FsPolicy,
    deadline: Instant,
    signals: Arc<Signals>,
) -> Result<Variables, SandboxError> {
    let engine = build_engine(limits, Arc::new(policy), deadline, signals.clone());

    let ast = engine.compile(code).map_err(|err| {
        let pos = err.position();
        SandboxError::Runtime {
            message: format!("syntax error: {}", err.err_type()),
            line: pos.line().map(|l| l as u32),
            column: pos.position().map(|c| c as u32),
        }
    })?;

    let mut scope = Scope::new();
    for (name, value) in seed {
        let dynamic = rhai::serde::to_dynamic(value).map_err(|e| {
            SandboxError::Internal(format!("cannot bind variable '{name}': {e}"))
        })?;
        scope.push_dynamic(name.clone(), dynamic);
    }

    match engine.run_ast_with_scope(&mut scope, &ast) {
        Ok(()) => Ok(harvest(&scope)),
        Err(err) => Err(classify(&err, &signals, limits)),
    }
}

fn build_engine(
    limits: &ResourceLimits,
    policy: Arc<FsPolicy>,
    deadline: Instant,
    signals: Arc<Signals>,
) -> Engine {
    let mut engine = Engine::new();

    let bytes = limits.memory_bytes();
    engine.set_max_string_size(bytes);
    engine.set_max_array_size(bytes / 16);
    engine.set_max_map_size(bytes / 16);
    engine.disable_symbol("eval");

    let s = signals.clone();
    engine.on_print(move |text| s.append_line(text));
    let s = signals.clone();
    engine.on_debug(move |text, _source, pos| {
        if pos.is_none() {
            s.append_line(text);
        } else {
            s.append_line(&format!("[{pos}] {text}"));
        }
    });

    let s = signals.clone();
    engine.on_progress(move |ops| {
        if s.is_cancelled() {
            s.interrupt(Interrupt::Cancelled);
            return Some(Dynamic::from("cancelled".to_string()));
        }
        if ops % DEADLINE_CHECK_EVERY == 0 && Instant::now() >= deadline {
            s.interrupt(Interrupt::Timeout);
            return Some(Dynamic::from("timeout".to_string()));
        }
        None
    });

    register_sleep(&mut engine, deadline, &signals);
    register_files(&mut engine, limits, &policy, &signals);
    register_network(&mut engine, limits, deadline, &signals);

    engine
}

// ============================================================================
// Host functions
// ============================================================================

fn terminate(signals: &Signals, cause: Interrupt) -> Box<EvalAltResult> {
    let token = match &cause {
        Interrupt::Timeout => "timeout".to_string(),
        Interrupt::Cancelled => "cancelled".to_string(),
        Interrupt::PermissionDenied(msg) => msg.clone(),
    };
    signals.interrupt(cause);
    EvalAltResult::ErrorTerminated(Dynamic::from(token), Position::NONE).into()
}

fn deny(signals: &Signals, message: String) -> Box<EvalAltResult> {
    terminate(signals, Interrupt::PermissionDenied(message))
}

/// A worker the executor has stopped waiting for must not touch the
/// directory a fresh session may already be using.
fn ensure_live(signals: &Signals) -> Result<(), Box<EvalAltResult>> {
    if signals.is_cancelled() {
        return Err(terminate(signals, Interrupt::Cancelled));
    }
    Ok(())
}

fn sleep_until_checked(
    secs: f64,
    deadline: Instant,
    signals: &Signals,
) -> Result<(), Box<EvalAltResult>> {
    if !secs.is_finite() || secs <= 0.0 {
        return Ok(());
    }
    let wake = Instant::now() + Duration::from_secs_f64(secs.min(1.0e6));
    loop {
        if signals.is_cancelled() {
            return Err(terminate(signals, Interrupt::Cancelled));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(terminate(signals, Interrupt::Timeout));
        }
        if now >= wake {
            return Ok(());
        }
        std::thread::sleep(SLEEP_SLICE.min(wake - now));
    }
}

fn register_sleep(engine: &mut Engine, deadline: Instant, signals: &Arc<Signals>) {
    let s = signals.clone();
    engine.register_fn("sleep", move |secs: rhai::INT| {
        sleep_until_checked(secs as f64, deadline, &s)
    });
    let s = signals.clone();
    engine.register_fn("sleep", move |secs: rhai::FLOAT| {
        sleep_until_checked(secs, deadline, &s)
    });
}

fn register_files(
    engine: &mut Engine,
    limits: &ResourceLimits,
    policy: &Arc<FsPolicy>,
    signals: &Arc<Signals>,
) {
    let (p, s) = (policy.clone(), signals.clone());
    engine.register_fn(
        "write_file",
        move |path: &str, text: &str| -> Result<(), Box<EvalAltResult>> {
            ensure_live(&s)?;
            let target = p.resolve_write(path).map_err(|msg| deny(&s, msg))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("write_file('{path}'): {e}"))?;
            }
            std::fs::write(&target, text).map_err(|e| format!("write_file('{path}'): {e}"))?;
            Ok(())
        },
    );

    let (p, s) = (policy.clone(), signals.clone());
    engine.register_fn(
        "append_file",
        move |path: &str, text: &str| -> Result<(), Box<EvalAltResult>> {
            use std::io::Write;

            ensure_live(&s)?;
            let target = p.resolve_write(path).map_err(|msg| deny(&s, msg))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("append_file('{path}'): {e}"))?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .map_err(|e| format!("append_file('{path}'): {e}"))?;
            file.write_all(text.as_bytes())
                .map_err(|e| format!("append_file('{path}'): {e}"))?;
            Ok(())
        },
    );

    let (p, s) = (policy.clone(), signals.clone());
    let max_bytes = limits.memory_bytes() as u64;
    engine.register_fn(
        "read_file",
        move |path: &str| -> Result<String, Box<EvalAltResult>> {
            let target = p.resolve_read(path).map_err(|msg| deny(&s, msg))?;
            let meta =
                std::fs::metadata(&target).map_err(|e| format!("read_file('{path}'): {e}"))?;
            if meta.len() > max_bytes {
                return Err(EvalAltResult::ErrorDataTooLarge(
                    format!("file '{path}'"),
                    Position::NONE,
                )
                .into());
            }
            let text = std::fs::read_to_string(&target)
                .map_err(|e| format!("read_file('{path}'): {e}"))?;
            Ok(text)
        },
    );

    let (p, s) = (policy.clone(), signals.clone());
    engine.register_fn(
        "file_exists",
        move |path: &str| -> Result<bool, Box<EvalAltResult>> {
            let target = p.resolve_read(path).map_err(|msg| deny(&s, msg))?;
            Ok(target.exists())
        },
    );

    let p = policy.clone();
    engine.register_fn("list_files", move || -> Array {
        let mut names: Vec<String> = walk_files(p.root())
            .filter_map(|(path, _)| {
                path.strip_prefix(p.root())
                    .ok()
                    .map(|rel| rel.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        names.into_iter().map(Dynamic::from).collect()
    });
}

fn register_network(
    engine: &mut Engine,
    limits: &ResourceLimits,
    deadline: Instant,
    signals: &Arc<Signals>,
) {
    let s = signals.clone();
    let allow_network = limits.allow_network;
    let max_bytes = limits.memory_bytes();
    engine.register_fn(
        "http_get",
        move |url: &str| -> Result<String, Box<EvalAltResult>> {
            if !allow_network {
                return Err(deny(&s, format!("network access is disabled (http_get '{url}')")));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(terminate(&s, Interrupt::Timeout));
            }

            let client = reqwest::blocking::Client::builder()
                .timeout(remaining)
                .build()
                .map_err(|e| format!("http_get('{url}'): {e}"))?;
            let response = client.get(url).send().map_err(|e| {
                if e.is_timeout() && Instant::now() >= deadline {
                    terminate(&s, Interrupt::Timeout)
                } else {
                    format!("http_get('{url}'): {e}").into()
                }
            })?;
            let too_large = || -> Box<EvalAltResult> {
                EvalAltResult::ErrorDataTooLarge(format!("response from '{url}'"), Position::NONE)
                    .into()
            };
            if response.content_length().is_some_and(|len| len > max_bytes as u64) {
                return Err(too_large());
            }

            let mut body = Vec::new();
            response
                .take(max_bytes as u64 + 1)
                .read_to_end(&mut body)
                .map_err(|e| {
                    if Instant::now() >= deadline {
                        terminate(&s, Interrupt::Timeout)
                    } else {
                        format!("http_get('{url}'): {e}").into()
                    }
                })?;
            if body.len() > max_bytes {
                return Err(too_large());
            }
            Ok(String::from_utf8_lossy(&body).into_owned())
        },
    );
}

// ============================================================================
// Results
// ============================================================================

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => innermost(inner),
        other => other,
    }
}

fn classify(err: &EvalAltResult, signals: &Signals, limits: &ResourceLimits) -> SandboxError {
    match signals.recorded_interrupt() {
        Some(Interrupt::Timeout) => {
            return SandboxError::Timeout {
                limit: limits.timeout,
            }
        }
        Some(Interrupt::Cancelled) => {
            return SandboxError::Cancelled("session was restarted".to_string())
        }
        Some(Interrupt::PermissionDenied(msg)) => return SandboxError::PermissionDenied(msg),
        None => {}
    }

    let inner = innermost(err);
    match inner {
        EvalAltResult::ErrorDataTooLarge(..) | EvalAltResult::ErrorStackOverflow(..) => {
            SandboxError::MemoryExceeded {
                limit_mb: limits.memory_mb,
            }
        }
        EvalAltResult::ErrorTerminated(..) => {
            SandboxError::Internal("script terminated without a recorded cause".to_string())
        }
        _ => {
            let pos = if inner.position().is_none() {
                err.position()
            } else {
                inner.position()
            };
            let message = match inner {
                EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
                other => other.to_string(),
            };
            SandboxError::Runtime {
                message,
                line: pos.line().map(|l| l as u32),
                column: pos.position().map(|c| c as u32),
            }
        }
    }
}

/// Final bindings that have a structural representation. `_`-prefixed names
/// are private to the run.
fn harvest(scope: &Scope) -> Variables {
    let mut vars = Variables::new();
    for (name, _is_constant, value) in scope.iter() {
        if name.starts_with('_') {
            continue;
        }
        if matches!(value.type_name(), "Fn" | "timestamp") {
            tracing::debug!(variable = name, kind = value.type_name(), "dropping non-serializable variable");
            continue;
        }
        match rhai::serde::from_dynamic::<serde_json::Value>(&value) {
            Ok(json) => {
                vars.insert(name.to_string(), json);
            }
            Err(e) => {
                tracing::debug!(variable = name, error = %e, "dropping non-serializable variable");
            }
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_secs(5),
            memory_mb: 16,
            allow_network: false,
            allow_file_io: false,
        }
    }

    fn run(code: &str, seed: Variables) -> (Result<Variables, SandboxError>, Arc<Signals>, TempDir) {
        let dir = TempDir::new().unwrap();
        let policy = FsPolicy::new(dir.path(), false).unwrap();
        let signals = Arc::new(Signals::default());
        let limits = limits();
        let deadline = Instant::now() + limits.timeout;
        let result = run_script(code, &seed, &limits, policy, deadline, signals.clone());
        (result, signals, dir)
    }

    #[test]
    fn test_seeded_variables_are_mutable() {
        let mut seed = Variables::new();
        seed.insert("x".to_string(), json!(1));
        let (result, _, _dir) = run("x = x + 41; let name = \"ok\";", seed);

        let vars = result.unwrap();
        assert_eq!(vars["x"], json!(42));
        assert_eq!(vars["name"], json!("ok"));
    }

    #[test]
    fn test_private_and_function_values_are_not_harvested() {
        let (result, _, _dir) = run("let _tmp = 1; let f = |a| a + 1; let keep = [1, 2];", Variables::new());

        let vars = result.unwrap();
        assert!(!vars.contains_key("_tmp"));
        assert!(!vars.contains_key("f"));
        assert_eq!(vars["keep"], json!([1, 2]));
    }

    #[test]
    fn test_print_is_captured() {
        let (result, signals, _dir) = run("print(\"hello\"); print(1 + 2);", Variables::new());
        assert!(result.is_ok());
        assert_eq!(signals.output(), "hello\n3\n");
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let (result, _, _dir) = run("let a = 1;\nlet = ;", Variables::new());
        match result.unwrap_err() {
            SandboxError::Runtime { line, message, .. } => {
                assert_eq!(line, Some(2));
                assert!(message.starts_with("syntax error"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_thrown_error_is_runtime_error() {
        let (result, _, _dir) = run("let a = 1;\nthrow \"boom\";", Variables::new());
        match result.unwrap_err() {
            SandboxError::Runtime { message, line, .. } => {
                assert_eq!(message, "boom");
                assert_eq!(line, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_policy_violation_cannot_be_caught() {
        let code = r#"
            try { write_file("../escape.txt", "x"); } catch (e) { print("swallowed"); }
            let after = 1;
        "#;
        let (result, signals, _dir) = run(code, Variables::new());
        assert!(matches!(result.unwrap_err(), SandboxError::PermissionDenied(_)));
        assert!(!signals.output().contains("swallowed"));
    }

    #[test]
    fn test_writes_are_refused_once_cancelled() {
        let dir = TempDir::new().unwrap();
        let policy = FsPolicy::new(dir.path(), false).unwrap();
        let signals = Arc::new(Signals::default());
        signals.cancel();
        let limits = limits();
        let deadline = Instant::now() + limits.timeout;

        let engine = build_engine(&limits, Arc::new(policy), deadline, signals.clone());
        for code in ["write_file(\"late.txt\", \"x\")", "append_file(\"late.txt\", \"x\")"] {
            assert!(engine.eval_expression::<()>(code).is_err());
        }

        assert!(!dir.path().join("late.txt").exists());
        assert_eq!(signals.recorded_interrupt(), Some(Interrupt::Cancelled));
    }

    #[test]
    fn test_output_is_capped() {
        let signals = Signals::default();
        let line = "x".repeat(OUTPUT_LIMIT / 2);
        signals.append_line(&line);
        signals.append_line(&line);
        signals.append_line("never");

        let output = signals.output();
        assert!(output.ends_with(TRUNCATED_MARKER));
        assert!(output.len() <= OUTPUT_LIMIT + TRUNCATED_MARKER.len());
        assert!(!output.contains("never"));
    }

    #[test]
    fn test_first_interrupt_wins() {
        let signals = Signals::default();
        signals.interrupt(Interrupt::Timeout);
        signals.interrupt(Interrupt::Cancelled);
        assert_eq!(signals.recorded_interrupt(), Some(Interrupt::Timeout));
    }
}
