use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Cluster identifier passed to every Operator call.
    #[arg(long, env = "CRM_CLUSTER_ID", default_value = "default")]
    pub cluster_id: String,

    /// Operator backend to wire up.
    #[arg(long, env = "CRM_OPERATOR", value_enum, default_value = "mock")]
    pub operator: OperatorKind,

    /// Postgres connection string. When absent, an in-memory store is used
    /// (the "no-db"/embedded mode).
    #[arg(long, env = "CRM_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Skip the idempotent `CREATE TABLE IF NOT EXISTS` on startup.
    #[arg(long, env = "CRM_NO_ENSURE_TABLE", default_value_t = false)]
    pub no_ensure_table: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Mock,
    Mesos,
    Kubernetes,
    DcMac,
}
