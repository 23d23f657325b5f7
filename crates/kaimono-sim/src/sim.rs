//! Simulation driver and convergence check.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use kaimono_client::{
    ClientConfig, ListSession, MemorySession, MemoryStore, Mutation, PrincipalDirectory,
    ReconcileError, StoreError, ViewSnapshot,
};
use kaimono_types::{ListId, NewRecord, Principal, Record, RecordPatch};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use strum::Display;
use tracing::{debug, info, warn};

const GROCERIES: &[&str] = &[
    "Milk", "Eggs", "Bread", "Butter", "Apples", "Rice", "Coffee", "Tomatoes", "Cheese",
    "Onions", "Yogurt", "Pasta", "Lemons", "Tea", "Spinach",
];

/// Attempts per client for the closing resync.
const FINAL_LOAD_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub clients: usize,
    pub ops: usize,
    pub seed: u64,
    pub max_latency_ms: u64,
    /// Percent of intents preceded by an injected store failure.
    pub fault_rate: u8,
    /// Drop every feed after this many intents; 0 disables.
    pub drop_every: usize,
    pub settle: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
enum Intent {
    Add,
    Toggle,
    Rename,
    Remove,
    Reorder,
    ClearDone,
    Reload,
}

impl Intent {
    fn pick(rng: &mut StdRng) -> Self {
        match rng.gen_range(0..100) {
            0..30 => Intent::Add,
            30..55 => Intent::Toggle,
            55..67 => Intent::Rename,
            67..79 => Intent::Remove,
            79..87 => Intent::Reorder,
            87..92 => Intent::ClearDone,
            _ => Intent::Reload,
        }
    }
}

type Confirmation = BoxFuture<'static, (Intent, Result<(), ReconcileError>)>;

fn confirm<T: Send + 'static>(intent: Intent, mutation: Mutation<T>) -> Confirmation {
    async move { (intent, mutation.confirmed().await.map(|_| ())) }.boxed()
}

struct SimClient {
    principal: Principal,
    store: Arc<MemorySession>,
    session: ListSession,
}

pub struct Simulation {
    options: SimOptions,
    store: MemoryStore,
    list: ListId,
    clients: Vec<SimClient>,
    names: PrincipalDirectory,
    rng: StdRng,
}

impl Simulation {
    /// Create the shared list and open it on every client.
    pub async fn start(options: SimOptions, config: ClientConfig) -> Result<Self> {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(options.seed);
        let principals: Vec<Principal> = (0..options.clients)
            .map(|i| Principal::new(format!("client{i}"), format!("Client {i}")))
            .collect();
        let owner = principals.first().context("no clients")?;
        let list = store.create_list(owner.id);
        for p in &principals[1..] {
            store.share(list, p.id);
        }

        let names = PrincipalDirectory::new();
        names.extend(&principals);

        let mut clients = Vec::with_capacity(principals.len());
        for principal in principals {
            let client = Arc::new(store.session(&principal));
            let latency = Duration::from_millis(rng.gen_range(0..=options.max_latency_ms));
            client.set_latency(latency);
            let session = ListSession::open(client.clone(), list, principal.id, config.clone())
                .await
                .with_context(|| format!("opening the list for {}", principal.display_name))?;
            debug!(client = %principal.display_name, ?latency, "client ready");
            clients.push(SimClient { principal, store: client, session });
        }
        Ok(Self { options, store, list, clients, names, rng })
    }

    /// Issue every intent, wait for the outcomes, then check convergence.
    pub async fn run(self) -> Result<Report> {
        let Simulation { options, store, list, clients, names, mut rng } = self;
        let mut tallies: BTreeMap<Intent, Tally> = BTreeMap::new();
        let mut inflight: FuturesUnordered<Confirmation> = FuturesUnordered::new();
        let mut feed_drops = 0;

        for step in 0..options.ops {
            if options.drop_every > 0 && step > 0 && step % options.drop_every == 0 {
                store.drop_feeds(list, "simulated transport drop");
                feed_drops += 1;
            }
            let client = &clients[rng.gen_range(0..clients.len())];
            let intent = Intent::pick(&mut rng);
            let tally = tallies.entry(intent).or_default();
            tally.issued += 1;
            if rng.gen_range(0..100u8) < options.fault_rate {
                client.store.fail_next(StoreError::transient("injected fault"));
            }
            match issue(client, intent, &mut rng) {
                Ok(Some(confirmation)) => inflight.push(confirmation),
                Ok(None) => tally.skipped += 1,
                Err(e) => {
                    debug!(client = %client.principal.display_name, %intent, "rejected locally: {e}");
                    tally.rejected += 1;
                }
            }

            // Let confirmations and feed traffic interleave with the next intent.
            tokio::time::sleep(Duration::from_millis(rng.gen_range(0..3))).await;
            while let Some(Some((intent, result))) = inflight.next().now_or_never() {
                tallies.entry(intent).or_default().settle(&result);
            }
        }
        while let Some((intent, result)) = inflight.next().await {
            tallies.entry(intent).or_default().settle(&result);
        }

        // A failed update is not rolled back, so each client reloads once the
        // dust has settled.
        for client in &clients {
            final_load(client).await;
        }
        await_convergence(&store, list, &clients, options.settle).await?;

        let rows = store.visible_records(list);
        let summaries = clients
            .iter()
            .map(|c| {
                let snap = c.session.snapshot();
                ClientSummary {
                    name: names.display_name(c.principal.id),
                    revision: snap.revision,
                    progress: snap.progress(),
                }
            })
            .collect();
        for client in clients {
            client.session.close().await?;
        }
        info!(records = rows.len(), "Simulation converged");

        Ok(Report {
            seed: options.seed,
            ops: options.ops,
            feed_drops,
            tallies,
            records: rows.len(),
            done: rows.iter().filter(|r| r.done).count(),
            clients: summaries,
        })
    }
}

/// Start one intent on `client`. `Ok(None)` means there was nothing to act on.
fn issue(
    client: &SimClient,
    intent: Intent,
    rng: &mut StdRng,
) -> Result<Option<Confirmation>, ReconcileError> {
    let engine = client.session.engine();
    let snap = engine.snapshot();
    // Provisional rows are still being created; leave them alone.
    let settled: Vec<&Record> = snap.items.iter().filter(|r| r.version > 0).collect();
    let target = settled.choose(rng).map(|r| (*r).clone());

    let confirmation = match (intent, target) {
        (Intent::Add, _) => {
            let text = GROCERIES.choose(rng).copied().unwrap_or("Milk");
            let payload = NewRecord::new(text).priority(rng.gen_bool(0.15));
            Some(confirm(intent, engine.add(payload)?))
        }
        (Intent::Toggle, Some(record)) => {
            Some(confirm(intent, engine.toggle_done(record.id, !record.done)?))
        }
        (Intent::Rename, Some(record)) => {
            let patch = RecordPatch::new().quantity(Some(rng.gen_range(1..6).to_string()));
            Some(confirm(intent, engine.update(record.id, patch)?))
        }
        (Intent::Remove, Some(record)) => Some(confirm(intent, engine.remove(record.id)?)),
        (Intent::Reorder, _) if snap.items.len() > 1 => {
            let mut order: Vec<_> = snap.items.iter().map(|r| r.id).collect();
            order.shuffle(rng);
            Some(confirm(intent, engine.reorder(&order)?))
        }
        (Intent::ClearDone, _) => Some(confirm(intent, engine.clear_done()?)),
        (Intent::Reload, _) => {
            let engine = engine.clone();
            Some(async move { (intent, engine.load().await) }.boxed())
        }
        _ => None,
    };
    Ok(confirmation)
}

async fn final_load(client: &SimClient) {
    for attempt in 1..=FINAL_LOAD_ATTEMPTS {
        match client.session.engine().load().await {
            Ok(()) => return,
            Err(e) => warn!(client = %client.principal.display_name, attempt, "final load failed: {e}"),
        }
    }
}

fn matches_store(snap: &ViewSnapshot, rows: &[Record]) -> bool {
    snap.items.len() == rows.len()
        && snap.items.iter().zip(rows).all(|(a, b)| a.id == b.id && a.same_content(b))
}

/// Poll until every client's view equals the store's visible rows.
async fn await_convergence(
    store: &MemoryStore,
    list: ListId,
    clients: &[SimClient],
    settle: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + settle;
    loop {
        let rows = store.visible_records(list);
        let diverged: Vec<&str> = clients
            .iter()
            .filter(|c| !matches_store(&c.session.snapshot(), &rows))
            .map(|c| c.principal.display_name.as_str())
            .collect();
        if diverged.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "{} client(s) did not converge within {:?}: {}",
                diverged.len(),
                settle,
                diverged.join(", ")
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Default)]
struct Tally {
    issued: usize,
    confirmed: usize,
    failed: usize,
    /// Refused before reaching the store (validation, provisional target).
    rejected: usize,
    /// Nothing to act on (e.g. toggle on an empty list).
    skipped: usize,
}

impl Tally {
    fn settle(&mut self, result: &Result<(), ReconcileError>) {
        match result {
            Ok(()) => self.confirmed += 1,
            Err(_) => self.failed += 1,
        }
    }
}

struct ClientSummary {
    name: String,
    revision: u64,
    progress: (usize, usize),
}

pub struct Report {
    seed: u64,
    ops: usize,
    feed_drops: usize,
    tallies: BTreeMap<Intent, Tally>,
    records: usize,
    done: usize,
    clients: Vec<ClientSummary>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "seed {}: {} intents, {} clients, {} feed drops",
            self.seed,
            self.ops,
            self.clients.len(),
            self.feed_drops
        )?;
        for (intent, t) in &self.tallies {
            writeln!(
                f,
                "  {:<11} issued {:>4}  confirmed {:>4}  failed {:>3}  rejected {:>3}  skipped {:>3}",
                intent.to_string(),
                t.issued,
                t.confirmed,
                t.failed,
                t.rejected,
                t.skipped
            )?;
        }
        writeln!(f, "converged on {} records ({} done)", self.records, self.done)?;
        for c in &self.clients {
            let (done, total) = c.progress;
            writeln!(f, "  {:<10} {done}/{total} done, {} view revisions", c.name, c.revision)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(seed: u64) -> SimOptions {
        SimOptions {
            clients: 3,
            ops: 60,
            seed,
            max_latency_ms: 5,
            fault_rate: 10,
            drop_every: 25,
            settle: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_simulation_converges() {
        let sim = Simulation::start(options(7), ClientConfig::default()).await.unwrap();
        let report = sim.run().await.unwrap();
        assert_eq!(report.clients.len(), 3);
        assert_eq!(report.tallies.values().map(|t| t.issued).sum::<usize>(), 60);
        assert_eq!(report.feed_drops, 2);
    }

    #[test]
    fn test_intent_pick_is_deterministic() {
        let mut a = StdRng::seed_from_u64(1);
        let mut b = StdRng::seed_from_u64(1);
        let left: Vec<Intent> = (0..20).map(|_| Intent::pick(&mut a)).collect();
        let right: Vec<Intent> = (0..20).map(|_| Intent::pick(&mut b)).collect();
        assert_eq!(left, right);
    }
}
