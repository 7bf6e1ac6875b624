//! ports - 抽象 trait 层
//!
//! 定义网关依赖的外部基础设施接口

mod counter;

pub use counter::*;
