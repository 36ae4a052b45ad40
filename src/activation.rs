//! Post-upload activation: the steps that make an uploaded worker reachable.

use futures_util::future::{try_join_all, BoxFuture};

use crate::error::PublishResult;

/// Routes listed verbatim in the report before the rest are summarized.
const REPORTED_ROUTE_LIMIT: usize = 9;

/// Summarize once more than this many routes are set.
const ROUTE_SUMMARY_THRESHOLD: usize = 10;

/// One launched activation step, resolving to its report lines.
pub type ActivationFuture<'a> = BoxFuture<'a, PublishResult<Vec<String>>>;

/// Drive every step concurrently and concatenate their report lines in the
/// order the steps were given.
///
/// The first failure wins and the other steps' results are dropped, even
/// when their remote writes already landed. A failed route update therefore
/// hides a schedule update that succeeded. Swapping this for a policy that
/// reports each outcome only needs to change this function.
pub async fn join_fail_fast(steps: Vec<ActivationFuture<'_>>) -> PublishResult<Vec<String>> {
    let results = try_join_all(steps).await?;
    Ok(results.into_iter().flatten().collect())
}

/// Report lines for a route update. Long lists keep the first few patterns
/// and summarize the rest.
pub fn route_targets(routes: &[String]) -> Vec<String> {
    if routes.len() <= ROUTE_SUMMARY_THRESHOLD {
        return routes.to_vec();
    }
    let mut targets: Vec<String> = routes.iter().take(REPORTED_ROUTE_LIMIT).cloned().collect();
    targets.push(format!(
        "...and {} more routes",
        routes.len() - REPORTED_ROUTE_LIMIT
    ));
    targets
}

/// Public URL on the account's workers.dev subdomain.
pub fn workers_dev_url(name: &str, environment: Option<&str>, subdomain: &str) -> String {
    match environment {
        Some(env) => format!("https://{}.{}.{}.workers.dev", env, name, subdomain),
        None => format!("https://{}.{}.workers.dev", name, subdomain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use futures_util::FutureExt;

    fn routes(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("example.com/r{}/*", i)).collect()
    }

    #[test]
    fn test_fifteen_routes_report_nine_and_summary() {
        let routes = routes(15);
        let targets = route_targets(&routes);

        assert_eq!(targets.len(), 10);
        assert_eq!(&targets[..9], &routes[..9]);
        assert_eq!(targets[9], "...and 6 more routes");
    }

    #[test]
    fn test_short_route_lists_are_reported_whole() {
        assert_eq!(route_targets(&routes(1)), routes(1));
        assert_eq!(route_targets(&routes(9)), routes(9));
    }

    #[test]
    fn test_ten_routes_are_reported_whole() {
        let routes = routes(10);
        let targets = route_targets(&routes);
        assert_eq!(targets.len(), 10);
        assert_eq!(targets, routes);
    }

    #[test]
    fn test_eleven_routes_summarize_two() {
        let routes = routes(11);
        let targets = route_targets(&routes);
        assert_eq!(&targets[..9], &routes[..9]);
        assert_eq!(targets[9], "...and 2 more routes");
        assert_eq!(targets.len(), 10);
    }

    #[test]
    fn test_workers_dev_url_shapes() {
        assert_eq!(
            workers_dev_url("api", None, "acme"),
            "https://api.acme.workers.dev"
        );
        assert_eq!(
            workers_dev_url("api", Some("staging"), "acme"),
            "https://staging.api.acme.workers.dev"
        );
    }

    #[tokio::test]
    async fn test_join_keeps_step_order() {
        let steps: Vec<ActivationFuture> = vec![
            async {
                tokio::task::yield_now().await;
                Ok(vec!["a".to_string()])
            }
            .boxed(),
            async { Ok(vec!["b".to_string(), "c".to_string()]) }.boxed(),
        ];
        assert_eq!(join_fail_fast(steps).await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_join_with_no_steps_is_empty() {
        assert!(join_fail_fast(Vec::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_fails_when_any_step_fails() {
        let steps: Vec<ActivationFuture> = vec![
            async { Ok(vec!["ok".to_string()]) }.boxed(),
            async { Err(PublishError::Configuration("boom".to_string())) }.boxed(),
        ];
        let err = join_fail_fast(steps).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
