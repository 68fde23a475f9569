//! 响应收集：把惰性的响应单元流收敛成一个字符串
//!
//! 逐个读取单元：非空文本追加到结果；遇到终止标记立即停止；
//! 否则在「已见到内容」（stop_on_first_content 开启时）或单元数达到 max_units 时停止。
//!
//! 注意：stop_on_first_content 会截断分多段到达的回复。需要完整多段回复时关闭它，
//! 此时只靠终止标记和 max_units 结束。

use futures_util::{Stream, StreamExt};

use super::traits::{BackendError, ResponseUnit};

/// 收集策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectorPolicy {
    /// 最多读取的单元数（防止后端流无限输出）
    pub max_units: usize,
    /// 第一个带文本的单元之后就停止
    pub stop_on_first_content: bool,
}

impl Default for CollectorPolicy {
    fn default() -> Self {
        Self {
            max_units: 10,
            stop_on_first_content: true,
        }
    }
}

impl CollectorPolicy {
    pub fn from_config(cfg: &crate::config::CollectorSection) -> Self {
        Self {
            max_units: cfg.max_units,
            stop_on_first_content: cfg.stop_on_first_content,
        }
    }
}

/// 收集一轮回复；没有任何文本时返回空字符串（只有终止标记也是合法回复）
pub async fn collect_response<S>(mut stream: S, policy: &CollectorPolicy) -> Result<String, BackendError>
where
    S: Stream<Item = Result<ResponseUnit, BackendError>> + Unpin,
{
    let max_units = policy.max_units.max(1);
    let mut response = String::new();
    let mut content_seen = false;
    let mut drained = 0usize;

    while let Some(unit) = stream.next().await {
        drained += 1;
        match unit? {
            ResponseUnit::Content { blocks } => {
                for block in blocks {
                    if !block.trim().is_empty() {
                        response.push_str(&block);
                        content_seen = true;
                    }
                }
            }
            ResponseUnit::Event => {}
            ResponseUnit::Terminal { status, text } => {
                if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                    response.push_str(&text);
                }
                tracing::debug!(?status, drained, "terminal marker received");
                break;
            }
        }

        if policy.stop_on_first_content && content_seen {
            break;
        }
        if drained >= max_units {
            tracing::debug!(drained, "response unit cap reached");
            break;
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn units(items: Vec<ResponseUnit>) -> impl Stream<Item = Result<ResponseUnit, BackendError>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_stops_on_first_content() {
        let s = units(vec![
            ResponseUnit::text("a"),
            ResponseUnit::text("b"),
            ResponseUnit::success(),
        ]);
        let out = collect_response(s, &CollectorPolicy::default()).await.unwrap();
        assert_eq!(out, "a");
    }

    #[tokio::test]
    async fn test_terminal_only_is_empty() {
        let s = units(vec![ResponseUnit::success()]);
        let out = collect_response(s, &CollectorPolicy::default()).await.unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn test_multi_fragment_when_disabled() {
        let policy = CollectorPolicy {
            stop_on_first_content: false,
            ..CollectorPolicy::default()
        };
        let s = units(vec![
            ResponseUnit::text("a"),
            ResponseUnit::Event,
            ResponseUnit::text("b"),
            ResponseUnit::success(),
            ResponseUnit::text("never"),
        ]);
        let out = collect_response(s, &policy).await.unwrap();
        assert_eq!(out, "ab");
    }

    #[tokio::test]
    async fn test_whitespace_only_is_not_content() {
        let s = units(vec![
            ResponseUnit::text("   "),
            ResponseUnit::text("real"),
            ResponseUnit::text("late"),
        ]);
        let out = collect_response(s, &CollectorPolicy::default()).await.unwrap();
        assert_eq!(out, "real");
    }

    #[tokio::test]
    async fn test_cap_bounds_drain() {
        let policy = CollectorPolicy {
            max_units: 3,
            stop_on_first_content: false,
        };
        let endless = stream::repeat_with(|| Ok(ResponseUnit::text("x")));
        let out = collect_response(endless, &policy).await.unwrap();
        assert_eq!(out, "xxx");

        let events = stream::repeat_with(|| Ok(ResponseUnit::Event));
        let out = collect_response(events, &CollectorPolicy::default()).await.unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn test_error_terminal_stops() {
        let s = units(vec![
            ResponseUnit::Event,
            ResponseUnit::Terminal {
                status: crate::backend::TerminalStatus::Error,
                text: Some("rate limited".into()),
            },
            ResponseUnit::text("after"),
        ]);
        let out = collect_response(s, &CollectorPolicy::default()).await.unwrap();
        assert_eq!(out, "rate limited");
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let s = stream::iter(vec![Err(BackendError::Closed)]);
        let err = collect_response(s, &CollectorPolicy::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::Closed));
    }
}
