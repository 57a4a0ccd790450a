use crate::errors::AppError;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, error, info};

/// ゲートウェイ操作をトレース
///
/// 所要時間をミリ秒で記録し、失敗時はエラーコード付きで出力する。
pub async fn trace_gateway_operation<T, Fut>(
    table: &str,
    operation: &str,
    future: Fut,
) -> Result<T, AppError>
where
    Fut: Future<Output = Result<T, AppError>>,
{
    let start_time = Instant::now();
    debug!(table, operation, "Gateway operation started");

    let result = future.await;
    let duration_ms = start_time.elapsed().as_millis() as u64;

    match &result {
        Ok(_) => {
            info!(
                table,
                operation, duration_ms, "Gateway operation completed successfully"
            );
        }
        Err(e) => {
            error!(
                table,
                operation,
                duration_ms,
                code = e.metadata().code,
                error = %e,
                "Gateway operation failed"
            );
        }
    }

    result
}

/// エラーをトレースに記録
pub fn record_error(error: &AppError, context: &str) {
    let metadata = error.metadata();
    error!(
        error = %error,
        code = metadata.code,
        severity = ?metadata.severity,
        context,
        "Error recorded in trace"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trace_passes_result_through() {
        let ok = trace_gateway_operation("task", "select", async { Ok::<_, AppError>(3) }).await;
        assert_eq!(ok, Ok(3));

        let err = trace_gateway_operation("task", "delete", async {
            Err::<(), _>(AppError::remote("boom"))
        })
        .await;
        assert_eq!(err, Err(AppError::remote("boom")));
    }
}
