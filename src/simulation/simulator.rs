//! Simulated fleet
//!
//! Each line runs `trains_per_line` trains shuttling between its terminals.
//! A train travels one segment (two adjacent stations) at a time, its
//! position linearly interpolated along the segment; at a terminal it
//! reverses. Every tick yields one `train_update` per train and one
//! `line_update` per line, plus notices for watchers:
//! - an arrival notice when a train's ETA at its next station first falls
//!   within the arrival window
//! - a delay notice when a random delay starts on a watched line

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::broker::Publisher;
use crate::broker::message::{
    FleetUpdateEvent, LineStatus, Notice, Occupancy, TrainPosition, TrainStatus,
};
use crate::broker::topic::LineId;
use crate::config::{SimulationSettings, Watcher};
use crate::persistence::{Line, Station, Topology};

const DELAY_REASONS: [&str; 5] = [
    "Problemas na via",
    "Sinalização defeituosa",
    "Interdição de passagem de nível",
    "Passageiro enfermo",
    "Verificação de segurança",
];

const OCCUPANCY: [Occupancy; 4] = [
    Occupancy::Baixa,
    Occupancy::Media,
    Occupancy::Alta,
    Occupancy::Superlotado,
];

const MIN_SPEED_KMH: f64 = 30.0;
const MAX_SPEED_KMH: f64 = 100.0;
/// Speed factor applied to trains on a delayed line.
const DELAY_SLOWDOWN: f64 = 0.4;

#[derive(Debug, Clone)]
struct SimTrain {
    id: String,
    line: usize,
    from: usize,
    to: usize,
    forward: bool,
    /// Fraction of the current segment covered, in `[0, 1)`.
    progress: f64,
    speed: f64,
    occupancy: Occupancy,
    announced: bool,
}

#[derive(Debug, Clone)]
struct Delay {
    ticks_left: u32,
    reason: String,
}

#[derive(Debug)]
pub struct FleetSimulator {
    lines: Vec<Line>,
    trains: Vec<SimTrain>,
    delays: HashMap<LineId, Delay>,
    watchers: Vec<Watcher>,
    tick: Duration,
    delay_probability: f64,
    arrival_window: Duration,
    rng: StdRng,
}

impl FleetSimulator {
    /// Place trains on every line of `topology` that has at least two
    /// stations.
    pub fn from_topology(topology: &dyn Topology, settings: &SimulationSettings) -> Self {
        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let lines: Vec<Line> = topology
            .lines()
            .into_iter()
            .filter(|line| line.stations.len() >= 2)
            .collect();

        let mut trains = Vec::new();
        for (line_idx, line) in lines.iter().enumerate() {
            let last = line.stations.len() - 1;
            for i in 0..settings.trains_per_line {
                let from = i * last / settings.trains_per_line;
                let (to, forward) = next_stop(from, i % 2 == 0, line.stations.len());
                trains.push(SimTrain {
                    id: format!("T{}{:02}", line.id, i + 1),
                    line: line_idx,
                    from,
                    to,
                    forward,
                    progress: rng.gen_range(0.0..1.0),
                    speed: rng.gen_range(40.0..90.0),
                    occupancy: *OCCUPANCY.choose(&mut rng).unwrap_or(&Occupancy::Media),
                    announced: false,
                });
            }
        }

        info!(
            "simulating {} trains on {} lines",
            trains.len(),
            lines.len()
        );

        Self {
            lines,
            trains,
            delays: HashMap::new(),
            watchers: settings.watchers.clone(),
            tick: settings.tick(),
            delay_probability: settings.delay_probability.clamp(0.0, 1.0),
            arrival_window: settings.arrival_window(),
            rng,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    pub fn train_count(&self) -> usize {
        self.trains.len()
    }

    pub fn is_delayed(&self, line: &LineId) -> bool {
        self.delays.contains_key(line)
    }

    /// Advance the fleet by one tick and return the resulting events.
    pub fn tick(&mut self) -> Vec<FleetUpdateEvent> {
        let mut notices = Vec::new();

        self.delays.retain(|_, delay| {
            delay.ticks_left = delay.ticks_left.saturating_sub(1);
            delay.ticks_left > 0
        });
        if let Some(event) = self.maybe_start_delay() {
            notices.extend(event);
        }

        let Self {
            lines,
            trains,
            delays,
            watchers,
            tick,
            arrival_window,
            rng,
            ..
        } = self;
        let hours = tick.as_secs_f64() / 3600.0;
        let mut events = Vec::with_capacity(trains.len() + lines.len());

        for train in trains.iter_mut() {
            let line = &lines[train.line];
            let stations = &line.stations;
            let delayed = delays.contains_key(&line.id);

            train.speed = (train.speed + rng.gen_range(-5.0..5.0)).clamp(MIN_SPEED_KMH, MAX_SPEED_KMH);
            let speed = if delayed {
                train.speed * DELAY_SLOWDOWN
            } else {
                train.speed
            };

            let segment = distance_km(&stations[train.from], &stations[train.to]).max(0.01);
            train.progress += speed * hours / segment;
            if train.progress >= 1.0 {
                train.progress = 0.0;
                train.from = train.to;
                (train.to, train.forward) = next_stop(train.from, train.forward, stations.len());
                train.announced = false;
            }

            if rng.gen_bool(0.05) {
                train.occupancy = *OCCUPANCY.choose(rng).unwrap_or(&train.occupancy);
            }

            let from = &stations[train.from];
            let to = &stations[train.to];
            let segment = distance_km(from, to).max(0.01);
            let eta_secs = (1.0 - train.progress) * segment / speed * 3600.0;

            if !train.announced && eta_secs <= arrival_window.as_secs_f64() {
                train.announced = true;
                let minutes = ((eta_secs / 60.0).ceil() as u32).max(1);
                for watcher in watchers.iter().filter(|w| w.line == line.id) {
                    notices.push(FleetUpdateEvent::arrival(Notice {
                        recipient: watcher.user,
                        title: format!("Trem chegando na {}", to.name),
                        body: format!(
                            "O trem {} da {} chegará na estação {} em {minutes} minutos.",
                            train.id, line.name, to.name
                        ),
                        line_id: Some(line.id.clone()),
                        station: Some(to.name.clone()),
                        train_id: Some(train.id.clone()),
                        minutes: Some(minutes),
                        reason: None,
                    }));
                }
            }

            let terminal = if train.forward {
                stations.last()
            } else {
                stations.first()
            };
            events.push(FleetUpdateEvent::train_update(TrainPosition {
                train_id: train.id.clone(),
                line_id: line.id.clone(),
                latitude: from.latitude + (to.latitude - from.latitude) * train.progress,
                longitude: from.longitude + (to.longitude - from.longitude) * train.progress,
                status: if delayed {
                    TrainStatus::Atrasado
                } else {
                    TrainStatus::Operacional
                },
                occupancy: train.occupancy,
                speed: (speed * 10.0).round() / 10.0,
                current_station: Some(from.name.clone()),
                next_station: Some(to.name.clone()),
                next_station_eta: Some(
                    Utc::now() + chrono::Duration::milliseconds((eta_secs * 1000.0) as i64),
                ),
                direction: terminal.map(|s| s.name.clone()),
            }));
        }

        for (idx, line) in lines.iter().enumerate() {
            let active = trains.iter().filter(|t| t.line == idx).count();
            let delay = delays.get(&line.id);
            events.push(FleetUpdateEvent::line_update(LineStatus {
                line_id: line.id.clone(),
                name: line.name.clone(),
                status: if delay.is_some() { "atrasado" } else { "normal" }.to_string(),
                active_trains: active,
                delayed_trains: if delay.is_some() { active } else { 0 },
                message: delay.map(|d| d.reason.clone()),
            }));
        }

        events.extend(notices);
        events
    }

    fn maybe_start_delay(&mut self) -> Option<Vec<FleetUpdateEvent>> {
        if self.lines.is_empty() || !self.rng.gen_bool(self.delay_probability) {
            return None;
        }
        let line = self.lines.choose(&mut self.rng)?;
        if self.delays.contains_key(&line.id) {
            return None;
        }

        let station = line.stations.choose(&mut self.rng)?;
        let reason = DELAY_REASONS.choose(&mut self.rng)?.to_string();
        let minutes = self.rng.gen_range(5..=20);
        self.delays.insert(
            line.id.clone(),
            Delay {
                ticks_left: self.rng.gen_range(5..=30),
                reason: reason.clone(),
            },
        );
        debug!("delay started on {}: {reason}", line.name);

        Some(
            self.watchers
                .iter()
                .filter(|w| w.line == line.id)
                .map(|watcher| {
                    FleetUpdateEvent::delay(Notice {
                        recipient: watcher.user,
                        title: format!("Atraso na {}", line.name),
                        body: format!(
                            "Há atrasos na {} próximo à estação {}. Motivo: {reason}",
                            line.name, station.name
                        ),
                        line_id: Some(line.id.clone()),
                        station: Some(station.name.clone()),
                        train_id: None,
                        minutes: Some(minutes),
                        reason: Some(reason.clone()),
                    })
                })
                .collect(),
        )
    }
}

/// Station after `from` in the direction of travel, reversing at a terminal.
fn next_stop(from: usize, forward: bool, stations: usize) -> (usize, bool) {
    match (forward, from) {
        (true, f) if f + 1 < stations => (f + 1, true),
        (false, f) if f > 0 => (f - 1, false),
        (true, f) => (f.saturating_sub(1), false),
        (false, f) => (f + 1, true),
    }
}

/// Great-circle distance in kilometres.
pub fn distance_km(a: &Station, b: &Station) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Publish every event from `feed`, in order, until all senders are gone.
/// Returns the number of events published.
pub async fn run_update_feed(
    mut feed: mpsc::Receiver<FleetUpdateEvent>,
    publisher: Arc<Publisher>,
) -> u64 {
    let mut published = 0;
    while let Some(event) = feed.recv().await {
        let report = publisher.publish(event).await;
        if report.dropped > 0 {
            debug!("{} slow subscribers lost an update", report.dropped);
        }
        published += 1;
    }
    info!("update feed closed after {published} events");
    published
}

/// Drive `simulator` on its tick interval, feeding its events into `feed`.
/// A full channel holds the simulator back; a closed one stops it.
pub async fn start_simulation_loop(
    mut simulator: FleetSimulator,
    feed: mpsc::Sender<FleetUpdateEvent>,
) {
    let mut ticker = tokio::time::interval(simulator.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        for event in simulator.tick() {
            if feed.send(event).await.is_err() {
                info!("update feed closed, stopping simulation");
                return;
            }
        }
    }
}
