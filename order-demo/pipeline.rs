//! Order pipeline servers. Messages are JSON dictionaries with a `command` key.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_genserver::{GenServer, JsonShape, ServerError, ServerRef, TypeContract, async_trait};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub items: BTreeMap<String, u32>,
}

fn is_dict(msg: &Value) -> bool {
    JsonShape::Object.matches(msg)
}

fn command(msg: &Value) -> &str {
    msg.get("command").and_then(Value::as_str).unwrap_or_default()
}

fn order_of(msg: &Value) -> anyhow::Result<Order> {
    let order = msg.get("order").cloned().context("message has no order")?;
    Ok(serde_json::from_value(order)?)
}

async fn pause(min_secs: f64, max_secs: f64) {
    let secs = rand::random_range(min_secs..max_secs);
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

/// Stock levels per item.
pub struct InventoryManager;

impl TypeContract for InventoryManager {
    type Cast = Value;
    type Call = Value;
    type State = HashMap<String, u32>;

    fn is_valid_cast(msg: &Value) -> bool {
        is_dict(msg)
    }

    fn is_valid_call(msg: &Value) -> bool {
        is_dict(msg)
    }
}

#[async_trait]
impl GenServer for InventoryManager {
    type InitArgs = HashMap<String, u32>;
    type Reply = Value;

    async fn init(&mut self, stock: HashMap<String, u32>) -> anyhow::Result<HashMap<String, u32>> {
        Ok(stock)
    }

    async fn handle_cast(
        &mut self,
        msg: Value,
        state: &HashMap<String, u32>,
    ) -> anyhow::Result<HashMap<String, u32>> {
        let mut stock = state.clone();
        match command(&msg) {
            "process_order" => {
                let order = order_of(&msg)?;
                let short: Vec<&String> = order
                    .items
                    .iter()
                    .filter(|(item, needed)| stock.get(*item).copied().unwrap_or(0) < **needed)
                    .map(|(item, _)| item)
                    .collect();
                if !short.is_empty() {
                    log::warn!(
                        "Order {} - Insufficient stock for items: {:?}",
                        order.order_id,
                        short
                    );
                    return Ok(stock);
                }
                for (item, needed) in &order.items {
                    if let Some(level) = stock.get_mut(item) {
                        *level -= needed;
                    }
                }
                log::info!("Inventory updated for order {}", order.order_id);
            }
            "add_stock" => {
                let item = msg
                    .get("item_name")
                    .and_then(Value::as_str)
                    .context("add_stock without item_name")?;
                let quantity = msg.get("quantity").and_then(Value::as_u64).unwrap_or(1);
                let level = stock.entry(item.to_string()).or_insert(0);
                *level += u32::try_from(quantity)?;
                log::info!(
                    "Added {} of {} to inventory. New stock: {}",
                    quantity,
                    item,
                    level
                );
            }
            other => anyhow::bail!("unknown cast command '{}'", other),
        }
        Ok(stock)
    }

    async fn handle_call(
        &mut self,
        msg: Value,
        state: &HashMap<String, u32>,
    ) -> anyhow::Result<(Value, HashMap<String, u32>)> {
        match command(&msg) {
            "get_stock" => {
                let item = msg.get("item_name").and_then(Value::as_str).unwrap_or_default();
                let level = state.get(item).copied().unwrap_or(0);
                Ok((json!(level), state.clone()))
            }
            other => anyhow::bail!("Call command '{}' not implemented", other),
        }
    }
}

/// Final status of at most `capacity` orders, evicting the oldest first.
#[derive(Debug, Clone)]
pub struct OrderLog {
    capacity: usize,
    statuses: HashMap<String, String>,
    arrival: VecDeque<String>,
}

impl OrderLog {
    pub fn new(capacity: usize) -> Self {
        OrderLog {
            capacity: capacity.max(1),
            statuses: HashMap::new(),
            arrival: VecDeque::new(),
        }
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.statuses.contains_key(order_id)
    }

    pub fn status(&self, order_id: &str) -> Option<&str> {
        self.statuses.get(order_id).map(String::as_str)
    }

    pub fn record(&mut self, order_id: String, status: &str) {
        if self.statuses.insert(order_id.clone(), status.to_string()).is_none() {
            self.arrival.push_back(order_id);
        }
        while self.arrival.len() > self.capacity {
            if let Some(oldest) = self.arrival.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
    }
}

const ORDER_LOG_CAPACITY: usize = 256;

/// Simulates order handling, then forwards orders to inventory and dispatch.
#[derive(Default)]
pub struct OrderProcessor {
    downstream: Option<(ServerRef<InventoryManager>, ServerRef<OrderDispatcher>)>,
}

impl TypeContract for OrderProcessor {
    type Cast = Value;
    type Call = Value;
    type State = OrderLog;

    fn is_valid_cast(msg: &Value) -> bool {
        is_dict(msg)
    }

    fn is_valid_call(msg: &Value) -> bool {
        is_dict(msg)
    }
}

#[async_trait]
impl GenServer for OrderProcessor {
    type InitArgs = (ServerRef<InventoryManager>, ServerRef<OrderDispatcher>);
    type Reply = Value;

    async fn init(&mut self, downstream: Self::InitArgs) -> anyhow::Result<OrderLog> {
        self.downstream = Some(downstream);
        Ok(OrderLog::new(ORDER_LOG_CAPACITY))
    }

    async fn handle_cast(&mut self, msg: Value, state: &OrderLog) -> anyhow::Result<OrderLog> {
        if command(&msg) != "process_order" {
            anyhow::bail!("unknown cast command '{}'", command(&msg));
        }
        let order = order_of(&msg)?;
        if state.contains(&order.order_id) {
            log::warn!(
                "Order {} already processed. Ignoring duplicate request.",
                order.order_id
            );
            return Ok(state.clone());
        }

        log::info!("Processing order {}", order.order_id);
        pause(0.2, 0.8).await;

        let mut statuses = state.clone();
        if rand::random_bool(0.2) {
            log::error!("Order {} processing failed!", order.order_id);
            statuses.record(order.order_id, "failed");
            return Ok(statuses);
        }

        log::info!(
            "Order {} processed successfully. Checking inventory.",
            order.order_id
        );
        let (inventory, dispatcher) = self
            .downstream
            .as_ref()
            .context("processor started without downstream servers")?;
        inventory.cast(json!({"command": "process_order", "order": order}))?;
        dispatcher.cast(json!({"command": "dispatch_order", "order": order}))?;
        statuses.record(order.order_id, "processed");
        Ok(statuses)
    }

    async fn handle_call(
        &mut self,
        msg: Value,
        state: &OrderLog,
    ) -> anyhow::Result<(Value, OrderLog)> {
        match command(&msg) {
            "get_order_status" => {
                let order_id = msg.get("order_id").and_then(Value::as_str).unwrap_or_default();
                let status = state.status(order_id).unwrap_or("unknown");
                Ok((json!(status), state.clone()))
            }
            other => anyhow::bail!("Call command '{}' not implemented", other),
        }
    }
}

/// Ships processed orders.
pub struct OrderDispatcher;

impl TypeContract for OrderDispatcher {
    type Cast = Value;
    type Call = Value;
    /// Ids of dispatched orders.
    type State = HashSet<String>;

    fn is_valid_cast(msg: &Value) -> bool {
        is_dict(msg)
    }

    fn is_valid_call(msg: &Value) -> bool {
        is_dict(msg)
    }
}

#[async_trait]
impl GenServer for OrderDispatcher {
    type InitArgs = ();
    type Reply = Value;

    async fn init(&mut self, _args: ()) -> anyhow::Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn handle_cast(
        &mut self,
        msg: Value,
        state: &HashSet<String>,
    ) -> anyhow::Result<HashSet<String>> {
        if command(&msg) != "dispatch_order" {
            anyhow::bail!("unknown cast command '{}'", command(&msg));
        }
        let order = order_of(&msg)?;
        log::info!("Dispatching order {}", order.order_id);
        pause(0.1, 0.5).await;

        let mut dispatched = state.clone();
        if rand::random_bool(0.1) {
            log::error!("Order {} dispatch FAILED!", order.order_id);
        } else {
            log::info!("Order {} dispatched successfully.", order.order_id);
            dispatched.insert(order.order_id);
        }
        Ok(dispatched)
    }

    async fn handle_call(
        &mut self,
        msg: Value,
        state: &HashSet<String>,
    ) -> anyhow::Result<(Value, HashSet<String>)> {
        match command(&msg) {
            "get_dispatched_count" => Ok((json!(state.len()), state.clone())),
            other => anyhow::bail!("Call command '{}' not implemented", other),
        }
    }
}

/// Emits a new order, then casts itself to emit the next one.
#[derive(Default)]
pub struct OrderGenerator {
    links: Option<(ServerRef<OrderGenerator>, ServerRef<OrderProcessor>)>,
}

impl TypeContract for OrderGenerator {
    type Cast = Value;
    type Call = Value;
    /// Orders generated so far.
    type State = u64;

    fn is_valid_cast(msg: &Value) -> bool {
        is_dict(msg)
    }

    fn is_valid_call(msg: &Value) -> bool {
        is_dict(msg)
    }
}

#[async_trait]
impl GenServer for OrderGenerator {
    type InitArgs = (ServerRef<OrderGenerator>, ServerRef<OrderProcessor>);
    type Reply = Value;

    async fn init(&mut self, links: Self::InitArgs) -> anyhow::Result<u64> {
        self.links = Some(links);
        Ok(0)
    }

    async fn handle_cast(&mut self, msg: Value, state: &u64) -> anyhow::Result<u64> {
        if command(&msg) != "generate_order" {
            anyhow::bail!("unknown cast command '{}'", command(&msg));
        }
        let (this, processor) = self
            .links
            .as_ref()
            .context("generator started without links")?;

        let order = Order {
            order_id: Uuid::new_v4().to_string(),
            items: BTreeMap::from([
                ("item_a".to_string(), rand::random_range(1..=3)),
                ("item_b".to_string(), rand::random_range(0..=2)),
                ("item_c".to_string(), rand::random_range(1..=2)),
            ]),
        };
        log::info!("Generated Order {}: {:?}", order.order_id, order.items);
        processor.cast(json!({"command": "process_order", "order": order}))?;

        pause(0.5, 1.5).await;
        match this.cast(json!({"command": "generate_order"})) {
            Ok(()) | Err(ServerError::NotRunning) => {}
            Err(error) => return Err(error.into()),
        }
        Ok(state + 1)
    }

    async fn handle_call(&mut self, msg: Value, state: &u64) -> anyhow::Result<(Value, u64)> {
        match command(&msg) {
            "get_order_count" => Ok((json!(state), *state)),
            other => anyhow::bail!("Call command '{}' not implemented", other),
        }
    }
}
