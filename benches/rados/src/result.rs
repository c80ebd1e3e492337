use std::sync::LazyLock;

use common::{bench::ExtractionMiss, record::Measurement};
use regex::Regex;

static BANDWIDTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Bandwidth\s*\(MB/sec\)\s*:[ \t]*(\S*)").unwrap());
static IOPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Average\s+IOPS\s*:[ \t]*(\S*)").unwrap());

/// First value following `label` in `output`.
///
/// `None` when the label is absent, `Some(Err)` when it is present but not
/// followed by a non-negative number.
fn labelled(re: &Regex, label: &'static str, output: &str) -> Option<Result<f64, ExtractionMiss>> {
    let cap = re.captures(output)?;
    let raw = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
    Some(
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or_else(|| ExtractionMiss::Invalid {
                label,
                value: raw.to_owned(),
            }),
    )
}

/// Pulls bandwidth and average IOPS out of `rados bench` output.
///
/// Both summary lines must be present, in any order and anywhere in the text.
pub fn parse_output(output: &str) -> Result<Measurement, ExtractionMiss> {
    match (
        labelled(&BANDWIDTH, "bandwidth", output),
        labelled(&IOPS, "IOPS", output),
    ) {
        (Some(bandwidth), Some(iops)) => Ok(Measurement {
            bandwidth: bandwidth?,
            iops: iops?,
        }),
        (None, None) => Err(ExtractionMiss::Both),
        (None, Some(_)) => Err(ExtractionMiss::Missing("bandwidth")),
        (Some(_), None) => Err(ExtractionMiss::Missing("IOPS")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RADOS_OUTPUT: &str = "\
hints = 1
Maintaining 16 concurrent writes of 4096 bytes to objects of size 4096 for up to 60 seconds or 0 objects
  sec Cur ops   started  finished  avg MB/s  cur MB/s last lat(s)  avg lat(s)
    0       0         0         0         0         0           -           0
   60      16    302713    302697   19.7058   19.4258  0.00324565  0.00317068
Total time run:         60.0031
Total writes made:      302713
Write size:             4096
Object size:            4096
Bandwidth (MB/sec):     19.7066
Stddev Bandwidth:       0.563405
Max bandwidth (MB/sec): 20.8438
Min bandwidth (MB/sec): 18.0742
Average IOPS:           5044
Stddev IOPS:            144.232
Max IOPS:               5336
Min IOPS:               4627
Average Latency(s):     0.00317036
";

    #[test]
    fn parses_rados_summary() {
        assert_eq!(
            parse_output(RADOS_OUTPUT),
            Ok(Measurement {
                bandwidth: 19.7066,
                iops: 5044.0,
            })
        );
    }

    #[test]
    fn label_order_does_not_matter() {
        let forward = "Bandwidth (MB/sec): 1.5\nnoise\nAverage IOPS: 384";
        let reversed = "Average IOPS: 384\nmore noise\n\nBandwidth (MB/sec): 1.5";
        assert_eq!(parse_output(forward), parse_output(reversed));
        assert!(parse_output(reversed).is_ok());
    }

    #[test]
    fn extraction_is_idempotent() {
        for text in [RADOS_OUTPUT, "Bandwidth (MB/sec): 3", ""] {
            assert_eq!(parse_output(text), parse_output(text));
        }
    }

    #[test]
    fn tolerates_whitespace() {
        let text = "Bandwidth (MB/sec)  :\t  12.5\nAverage   IOPS :  3200.25";
        assert_eq!(
            parse_output(text),
            Ok(Measurement {
                bandwidth: 12.5,
                iops: 3200.25,
            })
        );
    }

    #[test]
    fn one_label_alone_is_a_miss() {
        assert_eq!(
            parse_output("Bandwidth (MB/sec): 19.7"),
            Err(ExtractionMiss::Missing("IOPS"))
        );
        assert_eq!(
            parse_output("Average IOPS: 5044"),
            Err(ExtractionMiss::Missing("bandwidth"))
        );
        assert_eq!(
            parse_output("error: rados returned (2) No such file or directory"),
            Err(ExtractionMiss::Both)
        );
    }

    #[test]
    fn first_occurrence_wins() {
        let text = "Bandwidth (MB/sec): 1\nAverage IOPS: 2\nBandwidth (MB/sec): 3\nAverage IOPS: 4";
        assert_eq!(
            parse_output(text),
            Ok(Measurement {
                bandwidth: 1.0,
                iops: 2.0,
            })
        );
    }

    #[test]
    fn garbage_values_are_a_miss() {
        assert!(matches!(
            parse_output("Bandwidth (MB/sec): n/a\nAverage IOPS: 10"),
            Err(ExtractionMiss::Invalid { label: "bandwidth", .. })
        ));
        assert!(matches!(
            parse_output("Bandwidth (MB/sec): 1\nAverage IOPS: -4"),
            Err(ExtractionMiss::Invalid { label: "IOPS", .. })
        ));
        assert!(matches!(
            parse_output("Bandwidth (MB/sec):\nAverage IOPS: 4"),
            Err(ExtractionMiss::Invalid { .. })
        ));
    }
}
