use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn usage_and_exit() -> ! {
    eprintln!(
        "worldd\n\n\
USAGE:\n  worldd [--bind HOST:PORT] [--db PATH]\n\n\
ENV:\n  WORLDD_BIND           default 127.0.0.1:4001 (broker links connect here)\n  WORLDD_DB             default var/worldd.json (store snapshot file)\n  WORLDD_DB_PROBE_MS    default 3000\n  WORLDD_SWEEP_MS       default 60000 (checkdisconnected period)\n  WORLDD_VOID_GRACE_S   default 0 (seconds a disconnected player may linger in-world)\n  WORLDD_ADMINS         comma-separated emails allowed to /holler (empty: anyone)\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub db_probe: Duration,
    pub sweep: Duration,
    pub void_grace: Duration,
    pub admins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4001)),
            db_path: PathBuf::from("var/worldd.json"),
            db_probe: Duration::from_millis(3000),
            sweep: Duration::from_millis(60_000),
            void_grace: Duration::ZERO,
            admins: Vec::new(),
        }
    }
}

impl Config {
    pub fn is_admin(&self, email: &str) -> bool {
        self.admins.is_empty()
            || self
                .admins
                .iter()
                .any(|a| a.eq_ignore_ascii_case(email.trim()))
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn parse_args() -> Config {
    let d = Config::default();

    let mut bind: SocketAddr = std::env::var("WORLDD_BIND")
        .ok()
        .map(|v| v.parse().unwrap_or_else(|_| usage_and_exit()))
        .unwrap_or(d.bind);
    let mut db_path: PathBuf = std::env::var("WORLDD_DB")
        .map(PathBuf::from)
        .unwrap_or(d.db_path);
    let db_probe = env_u64("WORLDD_DB_PROBE_MS")
        .map(|ms| Duration::from_millis(ms.max(100)))
        .unwrap_or(d.db_probe);
    let sweep = env_u64("WORLDD_SWEEP_MS")
        .map(|ms| Duration::from_millis(ms.max(1000)))
        .unwrap_or(d.sweep);
    let void_grace = env_u64("WORLDD_VOID_GRACE_S")
        .map(Duration::from_secs)
        .unwrap_or(d.void_grace);
    let admins: Vec<String> = std::env::var("WORLDD_ADMINS")
        .ok()
        .map(|v| {
            v.split(',')
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--db" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                db_path = v.into();
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        db_path,
        db_probe,
        sweep,
        void_grace,
        admins,
    }
}
