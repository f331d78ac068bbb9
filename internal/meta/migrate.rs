use sqlx::migrate::{MigrateError, Migrator};
use sqlx::PgPool;
use std::path::PathBuf;

pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
    let migrator = load_migrator().await?;
    migrator.run(pool).await
}

fn migration_directory_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(raw) = std::env::var("COS_MIGRATIONS_DIR") {
        if !raw.trim().is_empty() {
            paths.push(PathBuf::from(raw));
        }
    }
    paths.push(PathBuf::from("/app/migrations"));
    paths.push(PathBuf::from("internal/meta/migrations"));
    paths.push(PathBuf::from("meta/migrations"));
    paths
}

pub(crate) async fn load_migrator() -> Result<Migrator, MigrateError> {
    for path in migration_directory_candidates() {
        if path.is_dir() {
            return Migrator::new(path).await;
        }
    }
    let error = std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "migration directory not found",
    );
    Err(MigrateError::Source(Box::new(error)))
}

#[cfg(test)]
mod tests {
    use super::migration_directory_candidates;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn candidates_include_env_override_first() {
        let _lock = ENV_LOCK.lock().expect("lock");
        env::set_var("COS_MIGRATIONS_DIR", "/tmp/custom-migrations");
        let candidates = migration_directory_candidates();
        assert_eq!(
            candidates.first().map(|p| p.display().to_string()),
            Some("/tmp/custom-migrations".to_string())
        );
        env::remove_var("COS_MIGRATIONS_DIR");
    }

    #[test]
    fn candidates_skip_blank_env_override() {
        let _lock = ENV_LOCK.lock().expect("lock");
        env::set_var("COS_MIGRATIONS_DIR", "   ");
        let candidates = migration_directory_candidates();
        assert_eq!(
            candidates.first().map(|p| p.display().to_string()),
            Some("/app/migrations".to_string())
        );
        env::remove_var("COS_MIGRATIONS_DIR");
    }
}
