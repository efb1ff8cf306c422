//! # Client Spec Validation
//!
//! Structural checks on generator output, run after sub-client flattening
//! and before any client is registered. Generators are application code;
//! a bad spec should fail the generator pass loudly instead of producing a
//! client that can never admit anything.
//!
//! ## Rules
//!
//! ```text
//! ┌──────────────────────┬────────────────────────────────────────────┐
//! │ Spec shape           │ Requirement                                │
//! ├──────────────────────┼────────────────────────────────────────────┤
//! │ any                  │ non-empty name                             │
//! │ requestLimit         │ interval ≥ 1, tokensToAdd ≥ 1, maxTokens ≥ 1│
//! │ concurrencyLimit     │ maxConcurrency ≥ 1                         │
//! │ sharedLimit          │ target ≠ self; no cycle within the family  │
//! │ retryOptions         │ thawRequestCount ≥ 1 when set              │
//! └──────────────────────┴────────────────────────────────────────────┘
//! ```
//!
//! A shared target that is not part of the same flattened family is left
//! to runtime resolution - another generator may legitimately provide it.

use crate::client_spec::ClientSpec;
use crate::error::{CourierError, Result};
use crate::rate_limit::RateLimitSpec;
use std::collections::{HashMap, HashSet};

/// Validates one flattened family of specs (a generator's output for one
/// top-level client, parent first).
pub fn validate_family(specs: &[ClientSpec]) -> Result<()> {
    let by_name: HashMap<&str, &ClientSpec> =
        specs.iter().map(|s| (s.name.as_str(), s)).collect();

    for spec in specs {
        validate_one(spec)?;

        if let RateLimitSpec::SharedLimit { client_name } = spec.effective_rate_limit() {
            if client_name == spec.name {
                return Err(CourierError::Validation(format!(
                    "client '{}' shares its limit with itself",
                    spec.name
                )));
            }
            check_share_chain(spec, &by_name)?;
        }
    }
    Ok(())
}

fn validate_one(spec: &ClientSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(CourierError::Validation(
            "client name must not be empty".to_string(),
        ));
    }

    match spec.effective_rate_limit() {
        RateLimitSpec::RequestLimit {
            interval,
            tokens_to_add,
            max_tokens,
        } => {
            if interval == 0 || tokens_to_add == 0 || max_tokens == 0 {
                return Err(CourierError::Validation(format!(
                    "client '{}': requestLimit fields must all be at least 1 \
                     (interval={}, tokensToAdd={}, maxTokens={})",
                    spec.name, interval, tokens_to_add, max_tokens
                )));
            }
        }
        RateLimitSpec::ConcurrencyLimit { max_concurrency } => {
            if max_concurrency == 0 {
                return Err(CourierError::Validation(format!(
                    "client '{}': maxConcurrency must be at least 1",
                    spec.name
                )));
            }
        }
        RateLimitSpec::NoLimit | RateLimitSpec::SharedLimit { .. } => {}
    }

    if let Some(0) = spec.retry_options.thaw_request_count {
        return Err(CourierError::Validation(format!(
            "client '{}': thawRequestCount must be at least 1",
            spec.name
        )));
    }

    Ok(())
}

/// Follows a shared-limit chain as far as it resolves within the family,
/// rejecting cycles. A chain leaving the family resolves at runtime.
fn check_share_chain(start: &ClientSpec, by_name: &HashMap<&str, &ClientSpec>) -> Result<()> {
    let mut visited: HashSet<String> = HashSet::from([start.name.clone()]);
    let mut current = start;

    while let RateLimitSpec::SharedLimit { client_name } = current.effective_rate_limit() {
        if !visited.insert(client_name.clone()) {
            return Err(CourierError::Validation(format!(
                "client '{}' is part of a sharedLimit cycle",
                start.name
            )));
        }
        match by_name.get(client_name.as_str()).copied() {
            Some(next) => current = next,
            None => return Ok(()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, limit: Option<RateLimitSpec>) -> ClientSpec {
        let mut spec = ClientSpec::new(name);
        spec.rate_limit = limit;
        spec
    }

    #[test]
    fn test_valid_family_passes() {
        let family = vec![
            spec(
                "api",
                Some(RateLimitSpec::ConcurrencyLimit { max_concurrency: 5 }),
            ),
            spec(
                "api:images",
                Some(RateLimitSpec::SharedLimit {
                    client_name: "api".to_string(),
                }),
            ),
        ];
        assert!(validate_family(&family).is_ok());
    }

    #[test]
    fn test_zero_bucket_fields_rejected() {
        let family = vec![spec(
            "api",
            Some(RateLimitSpec::RequestLimit {
                interval: 1000,
                tokens_to_add: 0,
                max_tokens: 5,
            }),
        )];
        assert!(matches!(
            validate_family(&family),
            Err(CourierError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let family = vec![spec(
            "api",
            Some(RateLimitSpec::ConcurrencyLimit { max_concurrency: 0 }),
        )];
        assert!(validate_family(&family).is_err());
    }

    #[test]
    fn test_self_share_rejected() {
        let family = vec![spec(
            "api",
            Some(RateLimitSpec::SharedLimit {
                client_name: "api".to_string(),
            }),
        )];
        assert!(validate_family(&family).is_err());
    }

    #[test]
    fn test_share_cycle_rejected() {
        let family = vec![
            spec(
                "a",
                Some(RateLimitSpec::SharedLimit {
                    client_name: "b".to_string(),
                }),
            ),
            spec(
                "b",
                Some(RateLimitSpec::SharedLimit {
                    client_name: "a".to_string(),
                }),
            ),
        ];
        assert!(validate_family(&family).is_err());
    }

    #[test]
    fn test_share_out_of_family_is_runtime_resolved() {
        let family = vec![spec(
            "mirror",
            Some(RateLimitSpec::SharedLimit {
                client_name: "elsewhere".to_string(),
            }),
        )];
        assert!(validate_family(&family).is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let family = vec![spec("  ", None)];
        assert!(validate_family(&family).is_err());
    }

    #[test]
    fn test_zero_thaw_count_rejected() {
        let mut bad = spec("api", None);
        bad.retry_options.thaw_request_count = Some(0);
        assert!(validate_family(&[bad]).is_err());
    }
}
