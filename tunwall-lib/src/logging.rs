use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Once;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{reload, Registry};
use tunwall_core::LogLevel;

static TRACING_INIT: Once = Once::new();
static FILTER_HANDLE: Lazy<Mutex<Option<reload::Handle<EnvFilter, Registry>>>> = Lazy::new(|| Mutex::new(None));

const DEFAULT_DIRECTIVE: &str = "info,tunwall_core=debug,tunwall=debug,tunwall_sock2uid=debug";

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Verbose => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error | LogLevel::Assert => "error",
    }
}

/// Filter directive for a verbosity chosen by the host
pub(crate) fn directive(level: LogLevel) -> String {
    let name = level_name(level);
    format!(
        "{},tunwall_core={},tunwall={},tunwall_sock2uid={}",
        level_name(level.max(LogLevel::Info)),
        name,
        name,
        name
    )
}

/// Install the global subscriber; later calls are no-ops
pub fn init_logging() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
        let (filter, handle) = reload::Layer::new(filter);
        *FILTER_HANDLE.lock() = Some(handle);

        #[cfg(target_os = "android")]
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_thread_ids(true).without_time())
                .with(LogcatLayer)
                .try_init()
                .ok();
        }

        #[cfg(not(target_os = "android"))]
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_thread_ids(true))
                .try_init()
                .ok();
        }

        tracing::info!("tunwall logging initialized");
    });
}

/// Change verbosity at run time
pub fn set_log_level(level: LogLevel) {
    let guard = FILTER_HANDLE.lock();
    let Some(handle) = guard.as_ref() else {
        return;
    };
    if let Err(e) = handle.modify(|filter| *filter = EnvFilter::new(directive(level))) {
        tracing::warn!("Failed to change log level: {}", e);
    }
}

#[cfg(target_os = "android")]
pub(crate) use logcat::{android_log, LogcatLayer};

#[cfg(target_os = "android")]
mod logcat {
    use std::ffi::CString;
    use tracing::Level;
    use tracing_subscriber::layer::Context;

    extern "C" {
        fn __android_log_write(prio: i32, tag: *const std::os::raw::c_char, text: *const std::os::raw::c_char) -> i32;
    }

    const TAG: &str = "tunwall";

    pub(crate) fn android_log(priority: i32, message: &str) {
        let tag = CString::new(TAG).unwrap_or_default();
        let msg = CString::new(message.replace('\0', " ")).unwrap_or_default();
        // SAFETY: both pointers are valid NUL-terminated strings for the call
        unsafe {
            __android_log_write(priority, tag.as_ptr(), msg.as_ptr());
        }
    }

    /// Forwards events to logcat
    pub(crate) struct LogcatLayer;

    impl<S> tracing_subscriber::Layer<S> for LogcatLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let metadata = event.metadata();
            let priority = match *metadata.level() {
                Level::TRACE => 2,
                Level::DEBUG => 3,
                Level::INFO => 4,
                Level::WARN => 5,
                Level::ERROR => 6,
            };

            let mut visitor = LogVisitor::default();
            event.record(&mut visitor);
            android_log(priority, &format!("{}: {}", metadata.target(), visitor.message));
        }
    }

    #[derive(Default)]
    struct LogVisitor {
        message: String,
    }

    impl tracing::field::Visit for LogVisitor {
        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            if field.name() == "message" || self.message.is_empty() {
                self.message = value.to_string();
            } else {
                self.message.push_str(&format!(" {}={}", field.name(), value));
            }
        }

        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" || self.message.is_empty() {
                self.message = format!("{:?}", value);
            } else {
                self.message.push_str(&format!(" {}={:?}", field.name(), value));
            }
        }
    }
}
