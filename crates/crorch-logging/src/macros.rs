//! ---
//! crorch_section: "03-persistence-logging"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Context-stamping logging macros."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Logging macros that attach [`LogContext`](crate::LogContext) fields.

#[doc(hidden)]
#[macro_export]
macro_rules! __crorch_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        $crate::__tracing::event!(
            $level,
            request_id = ctx.request_id.unwrap_or(""),
            logical_id = ctx.logical_id.unwrap_or(""),
            resource_type = ctx.resource_type.unwrap_or(""),
            request_type = ctx.request_type.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with lifecycle context.
#[macro_export]
macro_rules! crorch_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with lifecycle context.
#[macro_export]
macro_rules! crorch_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with lifecycle context.
#[macro_export]
macro_rules! crorch_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with lifecycle context.
#[macro_export]
macro_rules! crorch_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__crorch_event!($crate::__tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
