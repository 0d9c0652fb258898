//! # Keeper Testing Utils
//!
//! 工作区共享的测试工具：
//!
//! - **内存仓储**：共享同一份状态的全部仓储接口实现，项目删除会级联
//! - **MockAgentPool**：可编排的Agent池，支持按主机设置运行列表、不可达、拒绝启动
//! - **测试数据构建器**：任务实例与执行记录
//!
//! 作为 dev-dependency 使用：
//!
//! ```toml
//! [dev-dependencies]
//! keeper-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
