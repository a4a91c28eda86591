//! Read-only topology: lines and their ordered stations.
//!
//! The core only ever sees plain values returned by `Topology`, never live
//! handles into a database, so nothing here is shared mutably with the
//! fan-out path.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::broker::topic::LineId;
use crate::persistence::PersistenceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub code: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Position along the line, starting at 1.
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub name: String,
    pub color: String,
    pub stations: Vec<Station>,
}

pub trait Topology: Send + Sync {
    fn lines(&self) -> Vec<Line>;

    /// Stations of `line` ordered along the line, or `None` for an unknown
    /// line.
    fn stations_of(&self, line: &LineId) -> Option<Vec<Station>>;

    fn has_line(&self, line: &LineId) -> bool {
        self.stations_of(line).is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    lines: BTreeMap<LineId, Line>,
}

impl StaticTopology {
    pub fn new(lines: Vec<Line>) -> Self {
        let lines = lines
            .into_iter()
            .map(|mut line| {
                line.stations.sort_by_key(|s| s.order);
                (line.id.clone(), line)
            })
            .collect();
        Self { lines }
    }

    /// Load a JSON array of lines.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let raw = std::fs::read(path)?;
        let lines: Vec<Line> = serde_json::from_slice(&raw)?;
        Ok(Self::new(lines))
    }

    /// Built-in CPTM network (lines 7-Rubi, 10-Turquesa and 11-Coral).
    pub fn cptm() -> Self {
        Self::new(vec![
            line(
                "7",
                "Linha 7-Rubi",
                "#FF6347",
                &[
                    ("LUZ7", "Luz", -23.534684, -46.635199),
                    ("PBF7", "Palmeiras-Barra Funda", -23.527237, -46.665668),
                    ("AGB7", "Água Branca", -23.520150, -46.681050),
                    ("LAP7", "Lapa", -23.516033, -46.700721),
                    ("PIQ7", "Piqueri", -23.505199, -46.720368),
                    ("PIT7", "Pirituba", -23.485199, -46.739368),
                    ("VCL7", "Vila Clarice", -23.465199, -46.740368),
                    ("JAR7", "Jaraguá", -23.445199, -46.741368),
                    ("PER7", "Perus", -23.410283, -46.742836),
                    ("CAI7", "Caieiras", -23.366469, -46.740847),
                    ("FRO7", "Franco da Rocha", -23.324103, -46.726461),
                    ("FRM7", "Francisco Morato", -23.286847, -46.744932),
                    ("JUN7", "Jundiaí", -23.178453, -46.887738),
                ],
            ),
            line(
                "10",
                "Linha 10-Turquesa",
                "#9932CC",
                &[
                    ("BRA10", "Brás", -23.525484, -46.615299),
                    ("MOO10", "Mooca", -23.535484, -46.605299),
                    ("IPI10", "Ipiranga", -23.592484, -46.597299),
                    ("TAM10", "Tamanduateí", -23.600484, -46.580299),
                    ("SCS10", "São Caetano do Sul", -23.618484, -46.564299),
                    ("UTI10", "Utinga", -23.635484, -46.550299),
                    ("SAN10", "Santo André", -23.663484, -46.537299),
                    ("MAU10", "Mauá", -23.667484, -46.461299),
                    ("RIP10", "Ribeirão Pires", -23.712484, -46.413299),
                    ("RGS10", "Rio Grande da Serra", -23.745484, -46.398299),
                ],
            ),
            line(
                "11",
                "Linha 11-Coral",
                "#4169E1",
                &[
                    ("LUZ11", "Luz", -23.534684, -46.635199),
                    ("BRA11", "Brás", -23.525484, -46.615299),
                    ("TAT11", "Tatuapé", -23.540330, -46.576720),
                    ("CTR11", "Corinthians-Itaquera", -23.542480, -46.471180),
                    ("DBO11", "Dom Bosco", -23.544300, -46.446600),
                    ("GUA11", "Guaianases", -23.542600, -46.414900),
                    ("FVA11", "Ferraz de Vasconcelos", -23.541300, -46.369000),
                    ("POA11", "Poá", -23.528300, -46.345600),
                    ("SUZ11", "Suzano", -23.541000, -46.309700),
                    ("MDC11", "Estudantes", -23.516800, -46.222600),
                ],
            ),
        ])
    }
}

fn line(id: &str, name: &str, color: &str, stations: &[(&str, &str, f64, f64)]) -> Line {
    Line {
        id: LineId::from(id),
        name: name.to_string(),
        color: color.to_string(),
        stations: stations
            .iter()
            .zip(1u32..)
            .map(|(&(code, name, latitude, longitude), order)| Station {
                code: code.to_string(),
                name: name.to_string(),
                latitude,
                longitude,
                order,
            })
            .collect(),
    }
}

impl Topology for StaticTopology {
    fn lines(&self) -> Vec<Line> {
        self.lines.values().cloned().collect()
    }

    fn stations_of(&self, line: &LineId) -> Option<Vec<Station>> {
        self.lines.get(line).map(|l| l.stations.clone())
    }
}
