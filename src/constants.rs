//! System-wide defaults. Every value here can be overridden through the
//! environment-driven configuration in [`crate::config`].

// ⚙️ SCHEDULER
/// Upper bound on tasks in the `running` state at any instant.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;

/// Submission queue capacity. Submissions beyond this fail with
/// `capacity_exhausted` rather than growing without bound.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Dispatcher poll interval when the queue is empty or no admissible task
/// exists. ~10 polls/second keeps dispatch latency invisible to humans.
pub const TASK_POLL_INTERVAL_MS: u64 = 100;

/// Per-task wall-clock budget.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 60;

/// Scheduler-level retry ceiling for retryable failures.
pub const DEFAULT_RETRY_CEILING: u32 = 2;

// 🧹 RETENTION
/// Cleanup loop interval for finished tasks and results.
pub const CLEANUP_INTERVAL_SECS: u64 = 300;

/// Finished tasks and results older than this are dropped from memory.
pub const TASK_RETENTION_HOURS: i64 = 24;

// 🤖 LLM GATEWAY
/// Per-call timeout for the remote provider.
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;

/// Response cache entries.
pub const DEFAULT_LLM_CACHE_CAPACITY: usize = 1024;

/// Exponential backoff base for transient provider failures.
pub const LLM_BACKOFF_BASE_MS: u64 = 500;

/// Backoff multiplier per attempt.
pub const LLM_BACKOFF_FACTOR: u32 = 2;

/// Attempts per generate call, first try included.
pub const LLM_MAX_ATTEMPTS: u32 = 3;

// 🔍 RETRIEVAL
/// Stores queried in parallel per `query_multi` call.
pub const DEFAULT_RETRIEVAL_FANOUT: usize = 8;

/// Result cache TTL.
pub const DEFAULT_RETRIEVAL_CACHE_TTL_SECS: u64 = 60;

/// Validated store name shape. Names failing this regex never reach a
/// backend or the filesystem.
pub const STORE_NAME_PATTERN: &str = r"^[A-Za-z0-9_-]{1,64}$";

// 📡 EVENT BUS
/// Per-subscriber buffered events before the slow consumer is disconnected.
pub const DEFAULT_EVENT_SUBSCRIBER_BUFFER: usize = 256;

// 🧭 MANAGER
/// Classifier confidence below which the greeting fast path may apply.
pub const CLASSIFIER_CONFIDENCE_FLOOR: f64 = 0.4;

/// Query length (whitespace tokens) at or under which the greeting fast
/// path may apply.
pub const GREETING_MAX_TOKENS: usize = 3;

/// Static greeting set for the casual-chat fast path. Matched
/// case-insensitively after trimming punctuation.
pub const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "sup", "hiya", "howdy", "good morning", "good afternoon",
    "good evening", "thanks", "thank you", "bye", "goodbye",
];

/// Classifier sampling temperature; kept at or below 0.2 so intent mapping
/// stays near-deterministic.
pub const CLASSIFIER_TEMPERATURE: f32 = 0.1;
