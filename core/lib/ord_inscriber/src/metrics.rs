use vise::{Buckets, Counter, EncodeLabelSet, Family, Histogram, Metrics};

use crate::types::InscriberError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ErrorKindLabel {
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct OperationLabel {
    pub operation: String,
}

#[derive(Debug, Metrics)]
#[metrics(prefix = "ord_inscriber")]
pub struct InscriberMetrics {
    /// Number of unsigned commit transactions built
    pub commit_transactions_built: Counter,

    /// Number of signed reveal transactions built
    pub reveal_transactions_built: Counter,

    /// Number of transactions handed to the broadcaster
    pub transactions_broadcast: Counter,

    /// Number of failed operations, by error kind
    pub failures: Family<ErrorKindLabel, Counter>,

    /// Number of retried attempts, by operation
    pub retries: Family<OperationLabel, Counter>,

    /// Number of operations that failed after exhausting their retries, by operation
    pub max_retries_exceeded: Family<OperationLabel, Counter>,

    /// Fee paid by reveal transactions, in satoshis
    #[metrics(buckets = Buckets::exponential(100.0..=1_000_000.0, 10.0))]
    pub reveal_fee_sats: Histogram<f64>,
}

impl InscriberMetrics {
    pub fn record_failure(&self, error: &InscriberError) {
        self.failures[&ErrorKindLabel {
            kind: error.kind().code().to_string(),
        }]
            .inc();
    }
}

#[vise::register]
pub static METRICS: vise::Global<InscriberMetrics> = vise::Global::new();
