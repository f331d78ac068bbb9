use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;

struct DbConnectSettings {
    delay_ms: u64,
    max_attempts: u32,
}

pub async fn connect(dsn: &str) -> Result<PgPool, sqlx::Error> {
    let settings = load_connect_settings();
    let mut last_err = None;
    for attempt in 1..=settings.max_attempts {
        match connect_pool(dsn).await {
            Ok(pool) => return Ok(pool),
            Err(err) => {
                last_err = Some(err);
                if attempt < settings.max_attempts {
                    tracing::warn!(attempt, "postgres connect failed; retrying");
                    sleep(Duration::from_millis(settings.delay_ms)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(sqlx::Error::PoolTimedOut))
}

fn load_connect_settings() -> DbConnectSettings {
    let max_attempts = std::env::var("COS_POSTGRES_CONNECT_RETRIES")
        .ok()
        .and_then(|val| val.parse::<u32>().ok())
        .unwrap_or(30)
        .max(1);
    let delay_ms = std::env::var("COS_POSTGRES_CONNECT_DELAY_MS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(1000)
        .max(100);
    DbConnectSettings {
        delay_ms,
        max_attempts,
    }
}

async fn connect_pool(dsn: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(dsn)
        .await
}

#[cfg(test)]
mod tests {
    use super::load_connect_settings;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn connect_settings_use_defaults() {
        let _lock = ENV_LOCK.lock().expect("lock");
        env::remove_var("COS_POSTGRES_CONNECT_RETRIES");
        env::remove_var("COS_POSTGRES_CONNECT_DELAY_MS");
        let settings = load_connect_settings();
        assert_eq!(settings.max_attempts, 30);
        assert_eq!(settings.delay_ms, 1000);
    }

    #[test]
    fn connect_settings_clamp_minimums() {
        let _lock = ENV_LOCK.lock().expect("lock");
        env::set_var("COS_POSTGRES_CONNECT_RETRIES", "0");
        env::set_var("COS_POSTGRES_CONNECT_DELAY_MS", "5");
        let settings = load_connect_settings();
        assert_eq!(settings.max_attempts, 1);
        assert_eq!(settings.delay_ms, 100);
        env::remove_var("COS_POSTGRES_CONNECT_RETRIES");
        env::remove_var("COS_POSTGRES_CONNECT_DELAY_MS");
    }
}
