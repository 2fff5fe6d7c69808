use super::*;
use serial_test::serial;

fn clear_chorus_env() {
    for (key, _) in env::vars() {
        if key.starts_with("CHORUS_") {
            env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn missing_api_key_fails_load() {
    clear_chorus_env();
    let result = Config::from_env();
    assert!(matches!(result, Err(ChorusError::Configuration(_))));
}

#[test]
#[serial]
fn defaults_apply_when_only_key_is_set() {
    clear_chorus_env();
    env::set_var("CHORUS_LLM_API_KEY", "test-key-value");

    let config = Config::from_env().unwrap();
    assert_eq!(
        config.scheduler.max_concurrent_tasks,
        constants::DEFAULT_MAX_CONCURRENT_TASKS
    );
    assert_eq!(config.retrieval.fanout, constants::DEFAULT_RETRIEVAL_FANOUT);
    assert_eq!(
        config.events.subscriber_buffer,
        constants::DEFAULT_EVENT_SUBSCRIBER_BUFFER
    );
    assert_eq!(config.llm.timeout_secs, constants::DEFAULT_LLM_TIMEOUT_SECS);
    assert!(config.synthesize_plans);

    clear_chorus_env();
}

#[test]
#[serial]
fn invalid_base_url_is_rejected() {
    clear_chorus_env();
    env::set_var("CHORUS_LLM_API_KEY", "test-key-value");
    env::set_var("CHORUS_LLM_BASE_URL", "not a url");

    let result = Config::from_env();
    assert!(matches!(result, Err(ChorusError::Configuration(_))));

    clear_chorus_env();
}

#[test]
#[serial]
fn zero_concurrency_is_rejected() {
    clear_chorus_env();
    env::set_var("CHORUS_LLM_API_KEY", "test-key-value");
    env::set_var("CHORUS_MAX_CONCURRENT_TASKS", "0");

    let result = Config::from_env();
    assert!(matches!(result, Err(ChorusError::Configuration(_))));

    clear_chorus_env();
}

#[test]
#[serial]
fn overrides_are_honored() {
    clear_chorus_env();
    env::set_var("CHORUS_LLM_API_KEY", "test-key-value");
    env::set_var("CHORUS_MAX_CONCURRENT_TASKS", "9");
    env::set_var("CHORUS_RETRIEVAL_FANOUT", "3");
    env::set_var("CHORUS_RETRY_CEILING", "0");

    let config = Config::from_env().unwrap();
    assert_eq!(config.scheduler.max_concurrent_tasks, 9);
    assert_eq!(config.retrieval.fanout, 3);
    assert_eq!(config.scheduler.retry_ceiling, 0);

    clear_chorus_env();
}
