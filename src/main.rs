mod backup;
mod calc;
mod config;
mod db;
mod ipc;
mod logging;

use std::io::{self, BufRead, Write};

fn main() {
    let settings = config::Settings::load().unwrap_or_else(|e| {
        eprintln!("gradebookd: {e}; using defaults");
        config::Settings::default()
    });
    if let Err(e) = logging::init_tracing(&settings) {
        eprintln!("gradebookd: logging disabled: {e:#}");
    }

    let startup_workspace = settings.workspace().cloned();
    let mut state = ipc::AppState::new(settings);
    if let Some(path) = startup_workspace {
        if let Err(e) = ipc::select_workspace(&mut state, &path) {
            tracing::error!(
                workspace = %path.display(),
                error = %format!("{e:#}"),
                "startup workspace not opened"
            );
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gradebookd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // No id to echo back.
            Err(e) => ipc::err("", "bad_json", e.to_string(), None),
        };

        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
