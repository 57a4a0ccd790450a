//! タスク一覧のローカル状態をホスト型バックエンドと同期するコア
//!
//! 楽観的な変更（[`MutationController`]）とリアルタイムの変更
//! （[`Reconciler`]）は同じストアキュー（[`StoreHandle`]）を通して適用される。

pub mod controller;
pub mod notice;
pub mod queue;
pub mod reconciler;
pub mod session;
pub mod store;

pub use controller::*;
pub use notice::*;
pub use queue::*;
pub use reconciler::*;
pub use session::*;
pub use store::*;
