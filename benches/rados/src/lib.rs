use std::collections::HashMap;

use common::{
    bench::{Bench, ExtractionMiss},
    record::Measurement,
    runner::CommandSpec,
};
use serde::{Deserialize, Serialize};

pub mod result;

const DEFAULT_PROGRAM: &str = "bash";
const DEFAULT_SCRIPT: &str = "bench/bench.sh";

/// `rados bench` driven through a wrapper script that reads its parameters
/// from `BSIZE`, `BTIME` and `BTHREAD`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rados {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    /// Seconds per trial, passed as `BTIME`
    pub time: Option<u64>,
    /// Concurrent operations, passed as `BTHREAD`
    pub threads: Option<u32>,
}

#[typetag::serde(name = "rados")]
impl Bench for Rados {
    fn name(&self) -> &'static str {
        "rados"
    }

    fn cmd(&self, block_size: u64, env: &HashMap<String, String>) -> CommandSpec {
        let mut env = env.clone();
        env.insert("BSIZE".to_owned(), block_size.to_string());
        if let Some(time) = self.time {
            env.insert("BTIME".to_owned(), time.to_string());
        }
        if let Some(threads) = self.threads {
            env.insert("BTHREAD".to_owned(), threads.to_string());
        }

        CommandSpec {
            program: self
                .program
                .clone()
                .unwrap_or(DEFAULT_PROGRAM.to_owned()),
            args: self
                .args
                .clone()
                .unwrap_or(vec![DEFAULT_SCRIPT.to_owned()]),
            env,
        }
    }

    fn extract(&self, output: &str) -> Result<Measurement, ExtractionMiss> {
        result::parse_output(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_wrapper_script() {
        let cmd = Rados::default().cmd(4096, &HashMap::new());
        assert_eq!(cmd.program, "bash");
        assert_eq!(cmd.args, vec!["bench/bench.sh"]);
        assert_eq!(cmd.env.get("BSIZE").map(String::as_str), Some("4096"));
        assert!(!cmd.env.contains_key("BTIME"));
        assert!(!cmd.env.contains_key("BTHREAD"));
    }

    #[test]
    fn passes_duration_and_threads() {
        let rados = Rados {
            program: Some("sh".to_owned()),
            args: Some(vec!["run.sh".to_owned()]),
            time: Some(30),
            threads: Some(16),
        };
        let env = HashMap::from([
            ("CEPH_CONF".to_owned(), "/etc/ceph/ceph.conf".to_owned()),
            ("BSIZE".to_owned(), "1".to_owned()),
        ]);
        let cmd = rados.cmd(65536, &env);
        assert_eq!(cmd.to_string(), "BSIZE=65536 BTHREAD=16 BTIME=30 CEPH_CONF=/etc/ceph/ceph.conf sh run.sh");
    }

    #[test]
    fn deserializes_as_tagged_bench() {
        let bench: Box<dyn Bench> =
            serde_yml::from_str("type: rados\ntime: 60\nthreads: 8\n").unwrap();
        let rados = bench.downcast_ref::<Rados>().unwrap();
        assert_eq!(rados.time, Some(60));
        assert_eq!(rados.threads, Some(8));
    }
}
