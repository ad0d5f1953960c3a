use chrono::Duration;
use taskmill::failure::FailureCategory;

#[test]
fn classifies_auth_failures() {
    assert_eq!(
        FailureCategory::classify("401 Unauthorized"),
        FailureCategory::AuthError
    );
    assert_eq!(
        FailureCategory::classify("Authentication failed: bad API key"),
        FailureCategory::AuthError
    );
}

#[test]
fn classifies_quota_failures() {
    assert_eq!(
        FailureCategory::classify("monthly quota exceeded"),
        FailureCategory::QuotaExceeded
    );
    assert_eq!(
        FailureCategory::classify("Your credit balance is too low"),
        FailureCategory::QuotaExceeded
    );
    assert_eq!(
        FailureCategory::classify("billing account suspended"),
        FailureCategory::QuotaExceeded
    );
}

#[test]
fn classifies_rate_limits() {
    assert_eq!(
        FailureCategory::classify("429 Too Many Requests"),
        FailureCategory::RateLimited
    );
    assert_eq!(
        FailureCategory::classify("rate_limit_error: slow down"),
        FailureCategory::RateLimited
    );
}

#[test]
fn classifies_timeouts() {
    assert_eq!(
        FailureCategory::classify("request timed out after 120s"),
        FailureCategory::Timeout
    );
    assert_eq!(
        FailureCategory::classify("operation aborted"),
        FailureCategory::Timeout
    );
}

#[test]
fn classifies_overload() {
    assert_eq!(
        FailureCategory::classify("upstream returned 503"),
        FailureCategory::Overloaded
    );
    assert_eq!(
        FailureCategory::classify("Overloaded, please retry"),
        FailureCategory::Overloaded
    );
    assert_eq!(
        FailureCategory::classify("529 site overloaded"),
        FailureCategory::Overloaded
    );
}

#[test]
fn classifies_config_errors() {
    assert_eq!(
        FailureCategory::classify("could not decrypt credentials"),
        FailureCategory::ConfigError
    );
    assert_eq!(
        FailureCategory::classify("invalid encryption key"),
        FailureCategory::ConfigError
    );
}

#[test]
fn earlier_signatures_win_over_later_ones() {
    // "quota" outranks the "timeout" fragment in the same message.
    assert_eq!(
        FailureCategory::classify("quota check timed out"),
        FailureCategory::QuotaExceeded
    );
    // Auth outranks everything.
    assert_eq!(
        FailureCategory::classify("401 unauthorized after rate limit"),
        FailureCategory::AuthError
    );
}

#[test]
fn unrecognized_text_is_unknown() {
    assert_eq!(
        FailureCategory::classify("segfault in plugin"),
        FailureCategory::Unknown
    );
    assert_eq!(FailureCategory::classify(""), FailureCategory::Unknown);
}

#[test]
fn classification_is_case_insensitive() {
    assert_eq!(
        FailureCategory::classify("RATE LIMIT hit"),
        FailureCategory::RateLimited
    );
    assert_eq!(
        FailureCategory::classify("TIMEOUT"),
        FailureCategory::Timeout
    );
}

#[test]
fn bad_request_never_comes_from_classification() {
    for msg in ["bad request", "400 bad request", "invalid argument"] {
        assert_ne!(FailureCategory::classify(msg), FailureCategory::BadRequest);
    }
}

#[test]
fn retryable_set_is_exactly_the_transient_categories() {
    assert!(FailureCategory::RateLimited.is_retryable());
    assert!(FailureCategory::Overloaded.is_retryable());
    assert!(FailureCategory::Timeout.is_retryable());
    assert!(FailureCategory::ConfigError.is_retryable());

    assert!(!FailureCategory::AuthError.is_retryable());
    assert!(!FailureCategory::QuotaExceeded.is_retryable());
    assert!(!FailureCategory::BadRequest.is_retryable());
    assert!(!FailureCategory::Unknown.is_retryable());
}

#[test]
fn cooldowns_scale_with_severity() {
    assert_eq!(FailureCategory::ConfigError.cooldown(), Duration::minutes(5));
    assert_eq!(FailureCategory::AuthError.cooldown(), Duration::minutes(5));
    assert_eq!(FailureCategory::Overloaded.cooldown(), Duration::minutes(10));
    assert_eq!(FailureCategory::Timeout.cooldown(), Duration::minutes(10));
    assert_eq!(FailureCategory::RateLimited.cooldown(), Duration::minutes(60));
    assert_eq!(FailureCategory::QuotaExceeded.cooldown(), Duration::hours(6));
    assert_eq!(FailureCategory::BadRequest.cooldown(), Duration::hours(6));
    assert_eq!(FailureCategory::Unknown.cooldown(), Duration::hours(6));
}

#[test]
fn category_names_round_trip() {
    for category in [
        FailureCategory::AuthError,
        FailureCategory::QuotaExceeded,
        FailureCategory::RateLimited,
        FailureCategory::Timeout,
        FailureCategory::Overloaded,
        FailureCategory::ConfigError,
        FailureCategory::BadRequest,
        FailureCategory::Unknown,
    ] {
        let parsed: FailureCategory = category.to_string().parse().unwrap();
        assert_eq!(parsed, category);
    }
}
