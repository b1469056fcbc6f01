use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use log::warn;

/// Connection-pool settings, loadable from a line-oriented `key=value` file.
///
/// Recognized keys: `ip`, `port`, `username`, `password`, `dbname`,
/// `init_size`, `max_size`, `max_idle_time` (seconds), `connection_timeout`
/// (microseconds). Blank lines and lines without `=` are skipped; value
/// whitespace is trimmed; unknown keys are ignored.
///
/// Note the asymmetric units: `max_idle_time` counts seconds and also paces
/// the reaper thread, while `connection_timeout` counts microseconds and
/// bounds how long [`ConnectionPool::get`] blocks.
///
/// [`ConnectionPool::get`]: super::ConnectionPool::get
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub dbname: String,
    /// Connections established up front and kept as the floor.
    pub init_size: usize,
    /// Hard ceiling on live connections, idle plus leased.
    pub max_size: usize,
    /// Idle age at which the reaper retires surplus connections.
    pub max_idle_time: Duration,
    /// How long a lease request waits before returning empty.
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            ip: "127.0.0.1".to_string(),
            port: 3306,
            username: String::new(),
            password: String::new(),
            dbname: String::new(),
            init_size: 10,
            max_size: 100,
            max_idle_time: Duration::from_secs(60),
            connection_timeout: Duration::from_micros(100_000),
        }
    }
}

impl PoolConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<PoolConfig> {
        let content = fs::read_to_string(path)?;
        let mut config = PoolConfig::default();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let idx = match line.find('=') {
                Some(idx) => idx,
                None => continue,
            };

            let key = &line[..idx];
            let value = line[idx + 1..].trim();

            match key {
                "ip" => config.ip = value.to_string(),
                "port" => parse_into(&mut config.port, key, value),
                "username" => config.username = value.to_string(),
                "password" => config.password = value.to_string(),
                "dbname" => config.dbname = value.to_string(),
                "init_size" => parse_into(&mut config.init_size, key, value),
                "max_size" => parse_into(&mut config.max_size, key, value),
                "max_idle_time" => {
                    let mut secs = config.max_idle_time.as_secs();
                    parse_into(&mut secs, key, value);
                    config.max_idle_time = Duration::from_secs(secs);
                }
                "connection_timeout" => {
                    let mut micros = config.connection_timeout.as_micros() as u64;
                    parse_into(&mut micros, key, value);
                    config.connection_timeout = Duration::from_micros(micros);
                }
                _ => {}
            }
        }

        Ok(config)
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!("ignoring unparsable value for {}: {:?}", key, value),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::PoolConfig;

    #[test]
    fn parses_the_documented_format() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pool-config-{}.ini", std::process::id()));
        std::fs::write(
            &path,
            "ip=10.0.0.7\n\
             port=3307\n\
             username=app\n\
             password= s3cret \n\
             dbname=orders\n\
             \n\
             this line has no separator\n\
             init_size=3\n\
             max_size=5\n\
             max_idle_time=2\n\
             connection_timeout=10000\n\
             unknown_key=whatever\n\
             port=not-a-number\n",
        )
        .unwrap();

        let config = PoolConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.ip, "10.0.0.7");
        assert_eq!(config.port, 3307);
        assert_eq!(config.username, "app");
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.dbname, "orders");
        assert_eq!(config.init_size, 3);
        assert_eq!(config.max_size, 5);
        assert_eq!(config.max_idle_time, Duration::from_secs(2));
        assert_eq!(config.connection_timeout, Duration::from_micros(10_000));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(PoolConfig::from_file("/nonexistent/pool.ini").is_err());
    }
}
