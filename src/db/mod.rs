use std::str::FromStr;

use log::info;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

pub mod failure;
pub mod model;

pub use failure::*;
pub use model::*;

pub type Database = PgPool;

/// embedding 向量的固定维数
pub const EMBEDDING_DIM: usize = 512;

pub async fn init_db(url: &str) -> Result<Database, sqlx::Error> {
    info!("初始化数据库连接");

    let options = PgConnectOptions::from_str(url)?;
    let pool = PgPoolOptions::new().max_connections(8).connect_with(options).await?;

    info!("检查数据库迁移");
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// 把向量编码为 pgvector 的字面量形式，绑定参数后由 SQL 侧转换为 halfvec
pub fn encode_vector(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 8 + 2);
    out.push('[');
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_vector_literal() {
        assert_eq!(encode_vector(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(encode_vector(&[]), "[]");
    }
}
