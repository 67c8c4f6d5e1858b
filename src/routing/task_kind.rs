//! # Task Kinds
//!
//! The closed set of task types the workers know how to process. Handler
//! dispatch matches exhaustively on [`TaskKind`], so adding a task type is a
//! compile-time change rather than a string lookup that can silently miss.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::RoutingError;
use crate::constants::channels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Consulta,
    Internacao,
    Alta,
    Hemograma,
    RaioX,
    Tomografia,
    Protese,
    Orgao,
    Material,
    CargaPacientes,
    CargaMedicos,
    CargaExames,
}

impl TaskKind {
    pub const ALL: [TaskKind; 12] = [
        TaskKind::Consulta,
        TaskKind::Internacao,
        TaskKind::Alta,
        TaskKind::Hemograma,
        TaskKind::RaioX,
        TaskKind::Tomografia,
        TaskKind::Protese,
        TaskKind::Orgao,
        TaskKind::Material,
        TaskKind::CargaPacientes,
        TaskKind::CargaMedicos,
        TaskKind::CargaExames,
    ];

    /// Wire name carried in the `tipo` field
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Consulta => "consulta",
            TaskKind::Internacao => "internacao",
            TaskKind::Alta => "alta",
            TaskKind::Hemograma => "hemograma",
            TaskKind::RaioX => "raio_x",
            TaskKind::Tomografia => "tomografia",
            TaskKind::Protese => "protese",
            TaskKind::Orgao => "orgao",
            TaskKind::Material => "material",
            TaskKind::CargaPacientes => "carga_pacientes",
            TaskKind::CargaMedicos => "carga_medicos",
            TaskKind::CargaExames => "carga_exames",
        }
    }

    /// Channel this kind is routed to in the reference deployment
    pub fn default_channel(&self) -> &'static str {
        match self {
            TaskKind::Consulta | TaskKind::Internacao | TaskKind::Alta => channels::FLUXO_CLINICO,
            TaskKind::Hemograma | TaskKind::RaioX | TaskKind::Tomografia => channels::FLUXO_EXAMES,
            TaskKind::Protese | TaskKind::Orgao | TaskKind::Material => channels::FLUXO_OPME,
            TaskKind::CargaPacientes | TaskKind::CargaMedicos | TaskKind::CargaExames => {
                channels::INGESTAO_DADOS
            }
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RoutingError::EmptyTaskType);
        }
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RoutingError::unmapped(s))
    }
}
