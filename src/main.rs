//! BTC/INR Engine Simulation.
//!
//! Walks the engine through trading, DCA, the loan lifecycle and a liquidation cascade on a
//! manual clock, then runs the real scheduler for a moment on the system clock.
//!
//! Usage: `btcinr-sim [settings.toml]`. Set `RUST_LOG` to adjust logging and
//! `BTCINR_LOG_JSON=1` for JSON output.

use anyhow::{Context, Result};
use btcinr_core::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const HOUR: i64 = MILLIS_PER_HOUR;

/// Engine on a manual clock with a manual oracle, started at a fixed instant.
struct Sim {
    engine: Arc<Engine>,
    oracle: Arc<ManualOracle>,
    clock: Arc<ManualClock>,
}

impl Sim {
    fn new(settings: &EngineSettings) -> Result<Self> {
        let oracle = Arc::new(ManualOracle::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_767_225_600_000)));
        let engine = Engine::new(settings.clone(), oracle.clone(), clock.clone())
            .context("Failed to build engine")?;
        Ok(Self { engine: Arc::new(engine), oracle, clock })
    }

    fn price(&self, rupees: i64) -> Result<RateQuote> {
        self.oracle
            .publish_flat(rupees, self.clock.now())
            .context("price must be positive")
    }

    fn advance_hours(&self, hours: i64) {
        self.clock.advance(hours * HOUR);
    }
}

fn rupees(value: i64) -> Result<Price> {
    Price::from_rupees(value).context("price must be positive")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let settings = match std::env::args().nth(1) {
        Some(path) => EngineSettings::load(&path)?,
        None => EngineSettings::default(),
    };
    info!(version = settings.version, "settings loaded");

    println!("BTC/INR Ledger and Lending Engine Simulation\n");

    scenario_1_trading(&settings)?;
    scenario_2_dca(&settings)?;
    scenario_3_loan_lifecycle(&settings)?;
    scenario_4_liquidation_cascade(&settings)?;
    scenario_5_settings_and_audit(&settings)?;
    scenario_6_scheduler(&settings).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

/// Market and limit orders against one quote feed.
fn scenario_1_trading(settings: &EngineSettings) -> Result<()> {
    println!("Scenario 1: Market and Limit Orders\n");
    let sim = Sim::new(settings)?;
    let alice = UserId(1);

    sim.engine.deposit(alice, Currency::Inr, 100_000)?;
    sim.price(9_000_000)?;
    println!("  Alice deposits 100,000 INR; BTC at 9,000,000");

    let buy = sim.engine.place_market_order(alice, TradeSide::Buy, 20_000)?;
    println!("  Market buy 20,000 INR -> {} at {}", buy.btc_amount, buy.execution_price.map(|p| p.to_string()).unwrap_or_default());

    let limit = sim.engine.place_limit_order(alice, TradeSide::Buy, 10_000, rupees(8_900_000)?)?;
    println!("  Limit buy 10,000 INR at 8,900,000: {:?}", limit.status);

    sim.advance_hours(1);
    sim.price(8_900_000)?;
    let tick = sim.engine.on_price_tick()?;
    let filled = sim.engine.operation(limit.id).context("limit order missing")?;
    println!("  Price falls to 8,900,000: {} order(s) executed, got {}", tick.executed_orders.len(), filled.btc_amount);

    let balance = sim.engine.balance(alice)?;
    println!("  Alice now holds {} INR and {}\n", balance.inr_balance().value(), balance.btc_balance());
    Ok(())
}

/// A bounded daily DCA plan through a price spike.
fn scenario_2_dca(settings: &EngineSettings) -> Result<()> {
    println!("Scenario 2: DCA Plan with Price Bounds\n");
    let sim = Sim::new(settings)?;
    let bob = UserId(2);

    sim.engine.deposit(bob, Currency::Inr, 10_000)?;
    let plan = sim.engine.create_plan(
        bob,
        PlanRequest::buy(Frequency::Daily, 2_000)
            .executions(3)
            .max_price(rupees(9_500_000)?),
    )?;
    println!("  Bob buys 2,000 INR daily, 3 times, never above 9,500,000");

    for price in [9_000_000, 9_800_000, 9_200_000, 9_100_000] {
        sim.price(price)?;
        let report = sim.engine.run_dca_tick()?;
        println!(
            "  At {price}: executed {}, skipped {}, deferred {}",
            report.executed.len(),
            report.skipped.len(),
            report.deferred.len()
        );
        sim.advance_hours(24);
    }

    let plan = sim.engine.plan(plan.id).context("plan missing")?;
    println!("  Plan {:?} after {} executions\n", plan.status, plan.executions_done);
    Ok(())
}

/// Open, borrow, accrue, repay early with the minimum interest floor.
fn scenario_3_loan_lifecycle(settings: &EngineSettings) -> Result<()> {
    println!("Scenario 3: Loan Lifecycle\n");
    let sim = Sim::new(settings)?;
    let carol = UserId(3);

    sim.engine.deposit(carol, Currency::Btc, 1_000_000)?;
    sim.price(9_000_000)?;
    sim.engine.create_loan(carol, Sats(1_000_000))?;
    sim.engine.borrow(carol, Inr(54_000))?;
    println!("  Carol locks 0.01 BTC and borrows 54,000 INR (60% LTV)");

    match sim.engine.borrow(carol, Inr(1)) {
        Err(err) => println!("  One more rupee is refused: {}", err.kind()),
        Ok(_) => println!("  Unexpected: extra borrow accepted"),
    }

    sim.advance_hours(24 * 5);
    let accrual = sim.engine.accrue_interest();
    println!("  Five days later {} INR interest has accrued", accrual.total_booked.value());

    sim.price(9_000_000)?;
    let view = sim.engine.dashboard(carol)?;
    let loan = view.loan.context("loan missing from dashboard")?;
    println!("  Total due with the 30-day floor: {} INR", loan.total_due.value());

    sim.engine.deposit(carol, Currency::Inr, loan.total_due.value() - 54_000)?;
    let repay = sim.engine.repay(carol, loan.total_due)?;
    println!("  Carol repays in full and gets back {}\n", repay.btc_amount);
    Ok(())
}

/// Price crash takes several loans over the liquidation threshold at once.
fn scenario_4_liquidation_cascade(settings: &EngineSettings) -> Result<()> {
    println!("Scenario 4: Liquidation Cascade\n");
    let sim = Sim::new(settings)?;
    sim.price(9_000_000)?;

    let borrowers = [(UserId(10), 54_000), (UserId(11), 48_000), (UserId(12), 30_000)];
    for (user, amount) in borrowers {
        sim.engine.deposit(user, Currency::Btc, 1_000_000)?;
        sim.engine.create_loan(user, Sats(1_000_000))?;
        sim.engine.borrow(user, Inr(amount))?;
        let loan = sim.engine.active_loan(user)?;
        println!(
            "  User {} borrows {} INR, liquidation at {}",
            user.0,
            amount,
            loan.liquidation_price.map(|p| p.to_string()).unwrap_or_default()
        );
    }

    for price in [7_000_000, 5_900_000, 5_000_000, 3_000_000] {
        sim.advance_hours(1);
        sim.price(price)?;
        let tick = sim.engine.on_price_tick()?;
        for result in &tick.liquidations {
            println!(
                "  At {price}: user {} liquidated, proceeds {}, surplus {}, written off {}",
                result.user.0,
                result.proceeds.value(),
                result.surplus.value(),
                result.written_off.value()
            );
        }
    }
    println!();
    Ok(())
}

/// Settings versioning and the replay audit.
fn scenario_5_settings_and_audit(settings: &EngineSettings) -> Result<()> {
    println!("Scenario 5: Settings Versions and Audit\n");
    let sim = Sim::new(settings)?;
    let dave = UserId(4);
    sim.price(9_000_000)?;
    sim.engine.deposit(dave, Currency::Inr, 50_000)?;
    sim.engine.place_market_order(dave, TradeSide::Buy, 5_000)?;

    let mut next = EngineSettings::conservative();
    next.version = sim.engine.settings().version + 1;
    sim.engine.update_settings(next.clone())?;
    let stale = sim.engine.update_settings(next);
    println!("  Settings moved to v{}; replaying the same version: {}", sim.engine.settings().version, stale.is_err());

    let op = sim.engine.place_market_order(dave, TradeSide::Buy, 5_000)?;
    println!("  Next order recorded under settings v{}", op.settings_version);

    sim.engine.audit(dave)?;
    println!("  Replayed {} ledger events for Dave: balances match\n", sim.engine.ledger().events_for(dave).len());
    Ok(())
}

/// The background jobs on the system clock for a short window.
async fn scenario_6_scheduler(settings: &EngineSettings) -> Result<()> {
    println!("Scenario 6: Scheduler\n");
    let mut fast = settings.clone();
    fast.scheduler.price_tick_ms = 50;
    fast.scheduler.dca_tick_ms = 50;

    let oracle = Arc::new(ManualOracle::new());
    let engine = Arc::new(Engine::new(fast, oracle.clone(), Arc::new(SystemClock))?);
    let erin = UserId(5);
    engine.deposit(erin, Currency::Inr, 10_000)?;
    oracle.publish_flat(9_000_000, Timestamp::now());
    engine.create_plan(erin, PlanRequest::buy(Frequency::Hourly, 1_000))?;
    engine.place_limit_order(erin, TradeSide::Buy, 2_000, rupees(8_000_000)?)?;

    let handle = Scheduler::spawn(engine.clone());
    tokio::time::sleep(Duration::from_millis(200)).await;
    oracle.publish_flat(7_900_000, Timestamp::now());
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown().await;

    let ops = engine.operations(erin);
    let executed = ops.iter().filter(|op| op.status == OperationStatus::Executed).count();
    println!("  {} operations recorded, {} executed", ops.len(), executed);
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("btcinr_core=warn"));

    if std::env::var("BTCINR_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
