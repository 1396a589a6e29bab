//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`, `const MAX_RETRIES`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::NewTask;

/// Task は task_type タグと payload 型を結びつける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const TYPE: &'static str = "acme.mail.send.v1";
///     const MAX_RETRIES: Option<u32> = Some(8);
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: task payload として保存
/// - `DeserializeOwned`: 保存された payload から decode
/// - `Send + Sync + 'static`: Handler は `Arc` 越しに複数 task から使われる
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 命名規則: `{namespace}.{domain}.{action}.v{major}`
    const TYPE: &'static str;

    /// Retry budget of this type when a submission gives none. `None` uses
    /// the policy default.
    const MAX_RETRIES: Option<u32> = None;

    /// Submission request carrying this value as payload.
    fn to_new_task(&self) -> Result<NewTask, serde_json::Error> {
        let mut request = NewTask::new(Self::TYPE, serde_json::to_value(self)?);
        request.max_retries = Self::MAX_RETRIES;
        Ok(request)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{AnotherTestTask, TestTask};
    use super::*;

    #[test]
    fn to_new_task_carries_type_payload_and_budget() {
        let request = TestTask { value: 3 }.to_new_task().unwrap();
        assert_eq!(request.task_type.as_str(), TestTask::TYPE);
        assert_eq!(request.payload, serde_json::json!({ "value": 3 }));
        assert_eq!(request.max_retries, None);

        let another = AnotherTestTask {
            name: "x".into(),
            family: Default::default(),
        };
        assert_eq!(another.to_new_task().unwrap().max_retries, Some(1));
    }
}
