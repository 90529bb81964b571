// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppError, AppResult, LogConfig, RunModel};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Stdout-only subscriber, used by tests and local runs.
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter())
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("setup tracing: {}", e)))?;
    Ok(())
}

/// Installs the process subscriber: an hourly rolling file tee'd with stdout.
///
/// `Dev` writes colored human readable lines, `Production` writes one json
/// object per line. Every record carries timestamp, level and call site.
/// The returned guard must be held for the lifetime of the process, dropping it
/// flushes the non-blocking file writer.
pub fn setup_tracing(log_config: &LogConfig, model: RunModel) -> AppResult<WorkerGuard> {
    let file_appender = tracing_appender::rolling::hourly(&log_config.dir, &log_config.file_name);
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());

    let result = match model {
        RunModel::Dev => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(env_filter())
                .try_init()
        }
        RunModel::Production => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(env_filter())
                .try_init()
        }
    };
    result.map_err(|e| AppError::IllegalStateError(format!("setup tracing: {}", e)))?;

    Ok(worker_guard)
}
