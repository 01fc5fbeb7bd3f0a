use anyhow::anyhow;
use async_trait::async_trait;
use futures::{channel::mpsc, future};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use xswap::{
    htlc,
    monitor::{HtlcTransaction, TxStatus},
    transaction, BlockchainMonitor, BroadcastError, ChainEvent, ChainId, ChainTip, HtlcParams,
    Locktime, OutPoint, PaymentHash, Script, Transaction, Txid,
};

const BLOCK_TIME: u64 = 600;
const GENESIS_TIME: u64 = 1_600_000_000;

/// An in-memory blockchain. Broadcast transactions wait in the mempool until
/// the next call to [`MockChain::mine`]. Each block moves the median time by
/// ten minutes.
#[derive(Debug)]
pub struct MockChain {
    chain: ChainId,
    active: AtomicBool,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    height: u64,
    time_offset: u64,
    watched: Vec<Script>,
    mempool: Vec<Transaction>,
    blocks: HashMap<u64, Vec<Transaction>>,
    mined: HashMap<Txid, u64>,
    htlcs: HashMap<OutPoint, HtlcTransaction>,
    spends: HashMap<OutPoint, Transaction>,
    subscribers: Vec<mpsc::Sender<ChainEvent>>,
    failures: Vec<BroadcastError>,
    stalled: Vec<Script>,
    broadcast_attempts: usize,
}

impl State {
    fn median_time(&self) -> u64 {
        GENESIS_TIME + self.height * BLOCK_TIME + self.time_offset
    }

    fn emit(&mut self, event: ChainEvent) {
        for subscriber in &mut self.subscribers {
            let _ = subscriber.try_send(event.clone());
        }
    }

    fn mine_block(&mut self, transactions: Vec<Transaction>) {
        self.height += 1;
        let height = self.height;

        self.blocks.insert(height, transactions.clone());
        for transaction in transactions {
            let txid = transaction.txid();
            self.mined.insert(txid, height);

            for input in &transaction.input {
                let htlc = match self.htlcs.get(&input.previous_output) {
                    Some(htlc) => HtlcTransaction {
                        status: TxStatus::Spent,
                        ..htlc.clone()
                    },
                    None => continue,
                };
                self.htlcs.insert(htlc.outpoint, htlc.clone());
                self.spends.insert(htlc.outpoint, transaction.clone());

                let witness = input.witness.to_vec();
                let event = if witness.get(2) == Some(&vec![1]) {
                    ChainEvent::HtlcClaimed {
                        htlc,
                        transaction: transaction.clone(),
                        preimage: witness.get(1).cloned().unwrap_or_default(),
                        height,
                    }
                } else {
                    ChainEvent::HtlcRefunded {
                        htlc,
                        transaction: transaction.clone(),
                        height,
                    }
                };
                self.emit(event);
            }

            for (vout, output) in transaction.output.iter().enumerate() {
                if !self.watched.contains(&output.script_pubkey) {
                    continue;
                }
                let htlc = HtlcTransaction {
                    outpoint: OutPoint::new(txid, vout as u32),
                    amount: output.value,
                    script: output.script_pubkey.clone(),
                    confirmations: 1,
                    block_height: height,
                    status: TxStatus::Confirming,
                };
                self.htlcs.insert(htlc.outpoint, htlc.clone());
                self.emit(ChainEvent::HtlcDetected(htlc));
            }
        }

        let confirmed = self
            .htlcs
            .values_mut()
            .filter(|htlc| htlc.status == TxStatus::Confirming || htlc.status == TxStatus::Confirmed)
            .filter(|htlc| htlc.block_height < height)
            .map(|htlc| {
                htlc.confirmations = (height - htlc.block_height + 1) as u32;
                htlc.status = TxStatus::Confirmed;
                htlc.clone()
            })
            .collect::<Vec<_>>();
        for htlc in confirmed {
            self.emit(ChainEvent::HtlcConfirmed(htlc));
        }
    }
}

impl MockChain {
    pub fn new(chain: &str, height: u64) -> Arc<Self> {
        Arc::new(MockChain {
            chain: chain.parse().expect("valid chain id"),
            active: AtomicBool::new(false),
            state: Mutex::new(State {
                height,
                ..State::default()
            }),
        })
    }

    pub fn id(&self) -> ChainId {
        self.chain.clone()
    }

    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    /// Mines `blocks` blocks, the first one including the whole mempool.
    pub fn mine(&self, blocks: u64) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..blocks {
            let transactions = std::mem::take(&mut state.mempool);
            state.mine_block(transactions);
        }
    }

    /// Moves the tip without mining anything.
    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn median_time(&self) -> u64 {
        self.state.lock().unwrap().median_time()
    }

    /// Moves the median time of the tip without mining anything.
    pub fn set_median_time(&self, time: u64) {
        let mut state = self.state.lock().unwrap();
        state.time_offset = 0;
        state.time_offset = time
            .checked_sub(state.median_time())
            .expect("median time only moves forward");
    }

    /// Drops the last `depth` blocks. Their transactions go back to the
    /// mempool and the HTLCs they created are unconfirmed again. Nobody is
    /// notified.
    pub fn reorg(&self, depth: u64) {
        let mut state = self.state.lock().unwrap();
        let fork = state.height - depth;

        let mut orphaned = Vec::new();
        for height in fork + 1..=state.height {
            orphaned.extend(state.blocks.remove(&height).unwrap_or_default());
        }
        for transaction in &orphaned {
            let txid = transaction.txid();
            state.mined.remove(&txid);

            for input in &transaction.input {
                if state.spends.remove(&input.previous_output).is_some() {
                    if let Some(htlc) = state.htlcs.get_mut(&input.previous_output) {
                        htlc.status = TxStatus::Confirmed;
                    }
                }
            }
            for htlc in state.htlcs.values_mut() {
                if htlc.outpoint.txid == txid {
                    htlc.status = TxStatus::Pending;
                    htlc.confirmations = 0;
                    htlc.block_height = 0;
                }
            }
        }

        orphaned.append(&mut state.mempool);
        state.mempool = orphaned;
        state.height = fork;
    }

    /// The next broadcasts fail with the given errors, in order.
    pub fn fail_next_broadcasts(&self, errors: impl IntoIterator<Item = BroadcastError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    /// Broadcasts spending an HTLC locked with `script` never return.
    pub fn stall_spends_of(&self, script: Script) {
        self.state.lock().unwrap().stalled.push(script);
    }

    pub fn broadcast_attempts(&self) -> usize {
        self.state.lock().unwrap().broadcast_attempts
    }

    pub fn mempool(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().mempool.clone()
    }

    /// Hands an arbitrary event to all subscribers.
    pub fn inject(&self, event: ChainEvent) {
        self.state.lock().unwrap().emit(event);
    }

    pub fn subscribers(&self) -> usize {
        let state = self.state.lock().unwrap();

        state
            .subscribers
            .iter()
            .filter(|subscriber| !subscriber.is_closed())
            .count()
    }

    pub fn htlc(&self, outpoint: &OutPoint) -> Option<HtlcTransaction> {
        self.state.lock().unwrap().htlcs.get(outpoint).cloned()
    }
}

#[async_trait]
impl BlockchainMonitor for MockChain {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn chain_tip(&self) -> anyhow::Result<ChainTip> {
        let state = self.state.lock().unwrap();

        Ok(ChainTip {
            height: state.height,
            median_time: state.median_time(),
        })
    }

    async fn watch_for_htlc(&self, params: &HtlcParams) -> anyhow::Result<()> {
        let script = params.locking_script();
        let mut state = self.state.lock().unwrap();
        if !state.watched.contains(&script) {
            state.watched.push(script);
        }

        Ok(())
    }

    async fn stop_watching_htlc(&self, payment_hash: &PaymentHash) -> anyhow::Result<()> {
        self.state.lock().unwrap().watched.retain(|script| {
            htlc::extract_parameters(script)
                .map_or(true, |params| params.payment_hash() != payment_hash)
        });

        Ok(())
    }

    async fn htlc_transaction(&self, outpoint: &OutPoint) -> anyhow::Result<Option<HtlcTransaction>> {
        Ok(self.htlc(outpoint))
    }

    async fn confirmations(&self, txid: &Txid) -> anyhow::Result<u32> {
        let state = self.state.lock().unwrap();

        Ok(state
            .mined
            .get(txid)
            .map_or(0, |height| (state.height - height + 1) as u32))
    }

    async fn watch_for_preimage(&self, outpoint: &OutPoint) -> anyhow::Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let transaction = state
            .spends
            .get(outpoint)
            .ok_or_else(|| anyhow!("{} has not been spent", outpoint))?;

        transaction
            .input
            .iter()
            .find(|input| input.previous_output == *outpoint && input.witness.len() == 4)
            .and_then(|input| input.witness.to_vec().get(1).cloned())
            .ok_or_else(|| anyhow!("{} was not claimed", outpoint))
    }

    async fn is_htlc_spent(&self, outpoint: &OutPoint) -> anyhow::Result<bool> {
        Ok(self.state.lock().unwrap().spends.contains_key(outpoint))
    }

    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<Txid, BroadcastError> {
        let transaction =
            transaction::from_hex(raw_hex).map_err(|e| BroadcastError::Rejected(e.to_string()))?;

        let stalled = {
            let state = self.state.lock().unwrap();
            transaction.input.iter().any(|input| {
                state
                    .htlcs
                    .get(&input.previous_output)
                    .map_or(false, |htlc| state.stalled.contains(&htlc.script))
            })
        };
        if stalled {
            future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.broadcast_attempts += 1;

        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }
        let lock_time = u64::from(transaction.lock_time.0);
        if lock_time != 0
            && !Locktime::from_consensus(lock_time).is_reached(state.height, state.median_time())
        {
            return Err(BroadcastError::NotFinal);
        }

        let double_spend = transaction.input.iter().any(|input| {
            state.spends.contains_key(&input.previous_output)
                || state.mempool.iter().any(|pending| {
                    pending
                        .input
                        .iter()
                        .any(|other| other.previous_output == input.previous_output)
                })
        });
        if double_spend {
            return Err(BroadcastError::Rejected("input already spent".into()));
        }

        let txid = transaction.txid();
        state.mempool.push(transaction);

        Ok(txid)
    }

    fn subscribe(&self) -> mpsc::Receiver<ChainEvent> {
        let (sender, receiver) = mpsc::channel(1024);
        self.state.lock().unwrap().subscribers.push(sender);

        receiver
    }
}
