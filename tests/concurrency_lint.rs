#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! AST-level checks for the task and channel rules the client relies on.
//!
//! - A `loop` inside `tokio::spawn(...)` must contain a `select!`, otherwise
//!   the task cannot observe the shutdown token and `MpdClient::shutdown`
//!   hangs.
//! - The result of a channel `send` must not be dropped silently. A failed
//!   oneshot send means a caller gave up on its command; it is worth a log line.
//! - A lock or `watch` borrow guard must not live across an `.await`. The
//!   idle counters sit behind a std `Mutex` that the worker and callers share.
//!
//! ```ignore
//! // BAD: the requester may be gone
//! let _ = reply.send(result);
//!
//! // GOOD
//! if reply.send(result).is_err() {
//!     debug!("Connect caller went away");
//! }
//! ```

use std::fs;
use std::path::Path;
use syn::visit::Visit;
use syn::{Expr, ExprAwait, ExprCall, ExprLoop, ExprMacro, File, Local, Pat, Stmt, StmtMacro};
use walkdir::WalkDir;

/// Files where dropping a send result is fine.
/// Format: (file suffix, reason)
const SEND_ALLOWLIST: &[(&str, &str)] = &[(
    "bus/mod.rs",
    "Publishing with no subscribers is not an error",
)];

const GUARD_METHODS: &[&str] = &["lock", "read", "write", "try_lock", "borrow", "borrow_mut"];

/// Methods that pass a guard through unchanged
const GUARD_PASSTHROUGH: &[&str] = &["unwrap", "expect", "unwrap_or_else"];

#[derive(Default)]
struct Lints {
    file: String,
    spawn_depth: usize,
    loop_depth: usize,
    loop_has_select: bool,
    /// Live guards with the block depth they were bound at
    guards: Vec<(String, usize)>,
    block_depth: usize,
    violations: Vec<String>,
}

impl Lints {
    fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            ..Default::default()
        }
    }

    fn report(&mut self, message: String) {
        self.violations.push(format!("{}: {}", self.file, message));
    }

    fn send_allowed(&self) -> bool {
        SEND_ALLOWLIST
            .iter()
            .any(|(suffix, _)| self.file.ends_with(suffix))
    }

    fn is_send(expr: &Expr) -> bool {
        match expr {
            Expr::MethodCall(call) => call.method == "send",
            Expr::Await(awaited) => Self::is_send(&awaited.base),
            _ => false,
        }
    }

    fn is_select(mac: &syn::Macro) -> bool {
        mac.path
            .segments
            .last()
            .is_some_and(|s| s.ident == "select")
    }

    /// True when `expr` evaluates to a guard, e.g. `m.lock().unwrap()` or
    /// `rw.write().await`.
    fn is_guard(expr: &Expr) -> bool {
        match expr {
            Expr::Await(awaited) => Self::is_guard(&awaited.base),
            Expr::MethodCall(call) => {
                let method = call.method.to_string();
                if GUARD_PASSTHROUGH.contains(&method.as_str()) {
                    Self::is_guard(&call.receiver)
                } else {
                    GUARD_METHODS.contains(&method.as_str())
                }
            }
            _ => false,
        }
    }

    fn release(&mut self, name: &str) {
        self.guards.retain(|(guard, _)| guard != name);
    }
}

impl<'ast> Visit<'ast> for Lints {
    fn visit_expr_call(&mut self, call: &'ast ExprCall) {
        let is_spawn = matches!(&*call.func, Expr::Path(p)
            if p.path.segments.iter().map(|s| s.ident.to_string()).collect::<Vec<_>>()
                == ["tokio", "spawn"]);
        if is_spawn {
            self.spawn_depth += 1;
            for arg in &call.args {
                self.visit_expr(arg);
            }
            self.spawn_depth -= 1;
            return;
        }

        if let Expr::Path(p) = &*call.func {
            if p.path.is_ident("drop") {
                if let Some(Expr::Path(arg)) = call.args.first() {
                    if let Some(ident) = arg.path.get_ident() {
                        self.release(&ident.to_string());
                    }
                }
            }
        }
        syn::visit::visit_expr_call(self, call);
    }

    fn visit_expr_loop(&mut self, looped: &'ast ExprLoop) {
        if self.spawn_depth == 0 {
            syn::visit::visit_expr_loop(self, looped);
            return;
        }
        self.loop_depth += 1;
        let outer = std::mem::replace(&mut self.loop_has_select, false);
        syn::visit::visit_expr_loop(self, looped);
        if !self.loop_has_select {
            self.report("spawned loop without select! on a cancellation token".to_string());
        }
        self.loop_has_select = outer;
        self.loop_depth -= 1;
    }

    fn visit_expr_macro(&mut self, mac: &'ast ExprMacro) {
        if self.loop_depth > 0 && Self::is_select(&mac.mac) {
            self.loop_has_select = true;
        }
        syn::visit::visit_expr_macro(self, mac);
    }

    fn visit_stmt_macro(&mut self, mac: &'ast StmtMacro) {
        if self.loop_depth > 0 && Self::is_select(&mac.mac) {
            self.loop_has_select = true;
        }
        syn::visit::visit_stmt_macro(self, mac);
    }

    fn visit_stmt(&mut self, stmt: &'ast Stmt) {
        if !self.send_allowed() {
            match stmt {
                Stmt::Local(local) if matches!(local.pat, Pat::Wild(_)) => {
                    if local.init.as_ref().is_some_and(|i| Self::is_send(&i.expr)) {
                        self.report("`let _ = ...send(..)` drops the send result".to_string());
                    }
                }
                Stmt::Expr(expr, Some(_)) if Self::is_send(expr) => {
                    self.report("bare `...send(..);` drops the send result".to_string());
                }
                _ => {}
            }
        }
        syn::visit::visit_stmt(self, stmt);
    }

    fn visit_local(&mut self, local: &'ast Local) {
        syn::visit::visit_local(self, local);
        let Some(init) = &local.init else {
            return;
        };
        if !Self::is_guard(&init.expr) {
            return;
        }
        if let Pat::Ident(ident) = &local.pat {
            self.guards.push((ident.ident.to_string(), self.block_depth));
        }
    }

    fn visit_expr_await(&mut self, awaited: &'ast ExprAwait) {
        if !self.guards.is_empty() && !Self::is_guard(&Expr::Await(awaited.clone())) {
            let names: Vec<_> = self.guards.iter().map(|(n, _)| n.as_str()).collect();
            let message = format!(".await while holding guard(s): {}", names.join(", "));
            self.report(message);
        }
        syn::visit::visit_expr_await(self, awaited);
    }

    fn visit_block(&mut self, block: &'ast syn::Block) {
        self.block_depth += 1;
        syn::visit::visit_block(self, block);
        let depth = self.block_depth;
        self.guards.retain(|(_, bound_at)| *bound_at < depth);
        self.block_depth -= 1;
    }
}

fn lint_source(file: &str, source: &str) -> Vec<String> {
    let syntax: File = match syn::parse_file(source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Warning: Failed to parse {}: {}", file, e);
            return vec![];
        }
    };
    let mut lints = Lints::new(file);
    lints.visit_file(&syntax);
    lints.violations
}

#[test]
fn flags_spawned_loop_without_select() {
    let code = r#"
        fn start(mut rx: Receiver<ClientEvent>) {
            tokio::spawn(async move {
                loop {
                    let event = rx.recv().await;
                    handle(event);
                }
            });
        }
    "#;
    assert_eq!(lint_source("relay.rs", code).len(), 1);
}

#[test]
fn accepts_spawned_loop_with_select() {
    let code = r#"
        fn start(mut rx: Receiver<ClientEvent>, shutdown: CancellationToken) {
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = rx.recv() => handle(event),
                    }
                }
            });
        }
    "#;
    assert!(lint_source("relay.rs", code).is_empty());
}

#[test]
fn flags_dropped_send_results() {
    let code = r#"
        async fn answer(reply: oneshot::Sender<MpdResult<Response>>, tx: mpsc::Sender<Task>) {
            let _ = reply.send(Ok(Response::Ok));
            tx.send(Task::Reconnect).await;
        }
    "#;
    assert_eq!(lint_source("dispatcher.rs", code).len(), 2);
    assert!(lint_source("src/bus/mod.rs", code).is_empty());
}

#[test]
fn accepts_checked_send() {
    let code = r#"
        fn answer(reply: oneshot::Sender<()>) {
            if reply.send(()).is_err() {
                debug!("Disconnect caller went away");
            }
        }
    "#;
    assert!(lint_source("dispatcher.rs", code).is_empty());
}

#[test]
fn flags_guard_across_await() {
    let code = r#"
        async fn bump(counters: &Mutex<IdleStats>, transport: &mut Transport) {
            let mut stats = counters.lock().unwrap_or_else(PoisonError::into_inner);
            stats.idle_sent += 1;
            transport.send_line("idle").await;
        }
    "#;
    let violations = lint_source("dispatcher.rs", code);
    assert_eq!(violations.len(), 1);
    assert!(violations[0].contains("stats"));
}

#[test]
fn accepts_guard_released_before_await() {
    let code = r#"
        async fn bump(counters: &Mutex<IdleStats>, transport: &mut Transport) {
            {
                let mut stats = counters.lock().unwrap_or_else(PoisonError::into_inner);
                stats.idle_sent += 1;
            }
            let guard = counters.lock().unwrap();
            drop(guard);
            transport.send_line("idle").await;
        }
    "#;
    assert!(lint_source("dispatcher.rs", code).is_empty());
}

#[test]
fn source_tree_is_clean() {
    let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");

    let mut violations = Vec::new();
    for entry in WalkDir::new(&src_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let path = entry.path();
        let Ok(source) = fs::read_to_string(path) else {
            continue;
        };
        violations.extend(lint_source(&path.display().to_string(), &source));
    }

    if !violations.is_empty() {
        let mut message = String::from(
            "\n\nConcurrency lint violations:\n\
             - spawned loops need `tokio::select!` with `shutdown.cancelled()`\n\
             - check send results: `if tx.send(x).is_err() { debug!(..) }`\n\
             - scope lock guards so they drop before the next `.await`\n\n",
        );
        for violation in &violations {
            message.push_str(&format!("  - {}\n", violation));
        }
        panic!("{}", message);
    }
}
