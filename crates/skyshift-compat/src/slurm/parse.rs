//! Parsers for the Slurm command output the manager shells out for.
//!
//! Range values (`64+`, `2-4`) that sinfo/scontrol report for heterogeneous
//! partitions are resolved to their lower bound, so the scheduler never
//! overcommits a node that might be smaller than advertised.

use std::collections::BTreeMap;

use skyshift_types::kinds::JobState;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlurmNode {
    pub name: String,
    pub state: String,
    pub cpus_total: f64,
    pub cpus_alloc: f64,
    pub memory_mb_total: f64,
    pub memory_mb_alloc: f64,
    /// `(accelerator type, count)` from the `Gres` field.
    pub gres: Option<(String, u32)>,
    /// GPUs already allocated, from `AllocTRES`.
    pub gres_alloc: u32,
    pub features: Vec<String>,
}

/// Resolves a Slurm numeric field that may be a range: `64` -> 64,
/// `64+` -> 64, `2-4` -> 2.
pub fn parse_range_floor(value: &str) -> Option<f64> {
    let value = value.trim();
    let lower = value
        .split('-')
        .next()
        .unwrap_or(value)
        .trim_end_matches('+');
    lower.parse().ok()
}

/// Parses a `Gres` value like `gpu:V100:4` or `gpu:2` into an accelerator
/// type and count.
pub fn parse_gres(value: &str) -> Option<(String, u32)> {
    let value = value.trim();
    if value.is_empty() || value == "(null)" {
        return None;
    }

    // Strip consumption annotations such as `(S:0-1)`.
    let value = value.split('(').next().unwrap_or(value);
    let mut parts = value.split(':');
    let kind = parts.next()?;
    if kind != "gpu" {
        return None;
    }

    match (parts.next(), parts.next()) {
        (Some(type_), Some(count)) => Some((type_.to_string(), count.parse().ok()?)),
        (Some(count), None) => Some(("gpu".to_string(), count.parse().ok()?)),
        _ => None,
    }
}

/// Parses an `AllocTRES` value like `cpu=4,mem=16G,gres/gpu=2`.
pub fn parse_alloc_tres(value: &str) -> BTreeMap<String, f64> {
    let mut allocated = BTreeMap::new();
    for pair in value.split(',') {
        let Some((key, amount)) = pair.split_once('=') else {
            continue;
        };
        let amount = amount.trim();
        let numeric = if let Some(stripped) = amount.strip_suffix('G') {
            stripped.parse::<f64>().ok().map(|g| g * 1024.0)
        } else if let Some(stripped) = amount.strip_suffix('M') {
            stripped.parse::<f64>().ok()
        } else {
            parse_range_floor(amount)
        };
        if let Some(numeric) = numeric {
            allocated.insert(key.trim().to_string(), numeric);
        }
    }
    allocated
}

/// Parses `scontrol show nodes -o` output: one `Key=Value ...` line per
/// node.
pub fn parse_scontrol_nodes(output: &str) -> Vec<SlurmNode> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_scontrol_node_line)
        .collect()
}

fn parse_scontrol_node_line(line: &str) -> Option<SlurmNode> {
    let mut node = SlurmNode::default();
    for token in line.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "NodeName" => node.name = value.to_string(),
            "State" => node.state = value.to_string(),
            "CPUTot" => node.cpus_total = parse_range_floor(value)?,
            "CPUAlloc" => node.cpus_alloc = parse_range_floor(value).unwrap_or(0.0),
            "RealMemory" => node.memory_mb_total = parse_range_floor(value)?,
            "AllocMem" => node.memory_mb_alloc = parse_range_floor(value).unwrap_or(0.0),
            "Gres" => node.gres = parse_gres(value),
            "AllocTRES" => {
                node.gres_alloc = parse_alloc_tres(value)
                    .get("gres/gpu")
                    .copied()
                    .unwrap_or(0.0) as u32;
            }
            "AvailableFeatures" => {
                if value != "(null)" {
                    node.features = value.split(',').map(str::to_string).collect();
                }
            }
            _ => {}
        }
    }

    if node.name.is_empty() {
        None
    } else {
        Some(node)
    }
}

/// Extracts the job id from `sbatch` output
/// (`Submitted batch job 12345`).
pub fn parse_sbatch_job_id(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .last()
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Parses `squeue -h -o "%A|%T"` output into `(job id, state)` rows.
pub fn parse_squeue_rows(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (id, state) = line.trim().split_once('|')?;
            Some((id.to_string(), state.to_string()))
        })
        .collect()
}

/// Maps a Slurm job state onto the replica state machine.
pub fn slurm_state_to_job_state(state: &str) -> JobState {
    // sacct suffixes cancelled states with the user, e.g. `CANCELLED by 0`.
    let state = state.split_whitespace().next().unwrap_or(state);
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "CANCELLED" | "CANCELLED+" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL"
        | "PREEMPTED" | "BOOT_FAIL" | "DEADLINE" => JobState::Failed,
        _ => JobState::Pending,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SCONTROL_OUTPUT: &str = "\
NodeName=compute-1 Arch=x86_64 CoresPerSocket=16 CPUAlloc=8 CPUTot=64 CPULoad=3.10 AvailableFeatures=gpu,infiniband ActiveFeatures=gpu,infiniband Gres=gpu:V100:4 NodeAddr=10.0.0.1 NodeHostName=compute-1 RealMemory=256000 AllocMem=32000 FreeMem=190000 State=MIXED AllocTRES=cpu=8,mem=32000M,gres/gpu=2
NodeName=compute-2 Arch=x86_64 CPUAlloc=0 CPUTot=32+ AvailableFeatures=(null) Gres=(null) RealMemory=128000 AllocMem=0 State=IDLE AllocTRES=
";

    #[test]
    fn scontrol_nodes_parse_with_ranges_and_gres() {
        let nodes = parse_scontrol_nodes(SCONTROL_OUTPUT);
        assert_eq!(nodes.len(), 2);

        let first = &nodes[0];
        assert_eq!(first.name, "compute-1");
        assert_eq!(first.cpus_total, 64.0);
        assert_eq!(first.cpus_alloc, 8.0);
        assert_eq!(first.memory_mb_total, 256000.0);
        assert_eq!(first.memory_mb_alloc, 32000.0);
        assert_eq!(first.gres, Some(("V100".to_string(), 4)));
        assert_eq!(first.gres_alloc, 2);
        assert_eq!(first.features, vec!["gpu", "infiniband"]);

        let second = &nodes[1];
        // `32+` resolves to its floor.
        assert_eq!(second.cpus_total, 32.0);
        assert_eq!(second.gres, None);
        assert!(second.features.is_empty());
    }

    #[rstest]
    #[case("64", Some(64.0))]
    #[case("64+", Some(64.0))]
    #[case("2-4", Some(2.0))]
    #[case(" 8 ", Some(8.0))]
    #[case("abc", None)]
    fn range_floors(#[case] input: &str, #[case] expected: Option<f64>) {
        assert_eq!(parse_range_floor(input), expected);
    }

    #[rstest]
    #[case("gpu:V100:4", Some(("V100".to_string(), 4)))]
    #[case("gpu:2", Some(("gpu".to_string(), 2)))]
    #[case("gpu:A100:8(S:0-1)", Some(("A100".to_string(), 8)))]
    #[case("(null)", None)]
    #[case("", None)]
    #[case("fpga:2", None)]
    fn gres_values(#[case] input: &str, #[case] expected: Option<(String, u32)>) {
        assert_eq!(parse_gres(input), expected);
    }

    #[test]
    fn sbatch_output_yields_the_job_id() {
        assert_eq!(
            parse_sbatch_job_id("Submitted batch job 12345\n"),
            Some("12345".to_string())
        );
        assert_eq!(parse_sbatch_job_id("sbatch: error: something"), None);
    }

    #[test]
    fn squeue_rows_split_on_pipe() {
        let rows = parse_squeue_rows("981|RUNNING\n982|PENDING\n");
        assert_eq!(
            rows,
            vec![
                ("981".to_string(), "RUNNING".to_string()),
                ("982".to_string(), "PENDING".to_string()),
            ]
        );
    }

    #[rstest]
    #[case("PENDING", JobState::Pending)]
    #[case("RUNNING", JobState::Running)]
    #[case("COMPLETING", JobState::Running)]
    #[case("COMPLETED", JobState::Completed)]
    #[case("FAILED", JobState::Failed)]
    #[case("CANCELLED by 0", JobState::Failed)]
    #[case("TIMEOUT", JobState::Failed)]
    #[case("SOMETHING_NEW", JobState::Pending)]
    fn slurm_states_map_to_replica_states(#[case] input: &str, #[case] expected: JobState) {
        assert_eq!(slurm_state_to_job_state(input), expected);
    }

    #[test]
    fn alloc_tres_parses_mixed_units() {
        let allocated = parse_alloc_tres("cpu=8,mem=16G,gres/gpu=2");
        assert_eq!(allocated.get("cpu"), Some(&8.0));
        assert_eq!(allocated.get("mem"), Some(&(16.0 * 1024.0)));
        assert_eq!(allocated.get("gres/gpu"), Some(&2.0));
    }
}
