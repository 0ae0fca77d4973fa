//! DVNS: force-directed refinement of a candidate set.
//!
//! Candidates become particles around a query anchor at the origin. Gravity
//! pulls relevant particles in, elastic springs keep siblings from the same
//! document together, contradictions repel, and damping bleeds off energy.
//! Integration is semi-implicit Euler with a fixed step, so runs are
//! deterministic for a given input order and seed.

use crate::embedding::cosine_similarity;
use aimos_types::config::DvnsConfig;
use aimos_types::{AimosError, AimosResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Mul, Sub};
use std::time::{Duration, Instant};
use tracing::debug;

/// Similarity below which two particles repel.
const NEGATIVE_SIMILARITY: f64 = -0.3;
/// Particles without a document fall back to this many nearest neighbours.
const FALLBACK_NEIGHBOURS: usize = 2;
/// Lower bound on particle mass.
const MIN_MASS: f64 = 0.1;

/// Point or vector in the simulation space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn clamp_norm(self, max: f64) -> Self {
        let n = self.norm();
        if n > max && n > 0.0 {
            self * (max / n)
        } else {
            self
        }
    }

    fn clamp_cube(self, limit: f64) -> Self {
        Self::new(
            self.x.clamp(-limit, limit),
            self.y.clamp(-limit, limit),
            self.z.clamp(-limit, limit),
        )
    }

    fn random_unit(rng: &mut StdRng) -> Self {
        loop {
            let v = Self::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            let n = v.norm();
            if n > 1e-6 && n <= 1.0 {
                return v * (1.0 / n);
            }
        }
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, o: Vec3) {
        *self = *self + o;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, k: f64) -> Vec3 {
        Vec3::new(self.x * k, self.y * k, self.z * k)
    }
}

/// A candidate before placement.
#[derive(Debug, Clone)]
pub struct ParticleSeed {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    /// Coarse relevance in [0, 1].
    pub relevance: f64,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A candidate in the simulation.
#[derive(Debug, Clone, Serialize)]
pub struct Particle {
    pub id: String,
    pub content: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub position: Vec3,
    pub velocity: Vec3,
    pub mass: f64,
    pub relevance: f64,
    /// Cosine similarity to the query embedding.
    pub similarity: f64,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Particle {
    /// Distance to the query anchor.
    pub fn anchor_distance(&self) -> f64 {
        self.position.norm()
    }

    fn doc_key(&self) -> Option<&str> {
        ["doc_id", "source_doc", "source_id"]
            .iter()
            .find_map(|k| self.metadata.get(*k).and_then(|v| v.as_str()))
    }

    fn conflicts_with(&self, other: &Particle) -> bool {
        let listed = |p: &Particle, id: &str| {
            p.metadata
                .get("conflict_with")
                .and_then(|v| v.as_array())
                .is_some_and(|ids| ids.iter().any(|x| x.as_str() == Some(id)))
        };
        if listed(self, &other.id) || listed(other, &self.id) {
            return true;
        }
        match (crate::conflict::stance_of(&self.metadata), crate::conflict::stance_of(&other.metadata)) {
            (Some(a), Some(b)) => {
                a != b
                    && crate::conflict::topic_of(&self.metadata).is_some()
                    && crate::conflict::topic_of(&self.metadata) == crate::conflict::topic_of(&other.metadata)
            }
            _ => false,
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    MaxIterations,
    TimeLimit,
}

/// Outcome metrics of one run.
#[derive(Debug, Clone, Serialize)]
pub struct DvnsMetrics {
    pub iterations: usize,
    pub converged: bool,
    pub termination: Termination,
    pub max_velocity: f64,
    pub avg_velocity: f64,
    /// Mean per-particle displacement of the last step.
    pub avg_displacement: f64,
    /// Mean distance from starting position.
    pub total_displacement: f64,
    pub elapsed_ms: u64,
}

/// The physics engine.
pub struct DvnsPhysics {
    config: DvnsConfig,
}

impl DvnsPhysics {
    pub fn new(config: DvnsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DvnsConfig {
        &self.config
    }

    /// Place seeds on shells around the anchor: the less similar to the
    /// query, the farther out. Directions come from the seeded RNG.
    pub fn create_particles(&self, seeds: Vec<ParticleSeed>, query_embedding: &[f32]) -> Vec<Particle> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        seeds
            .into_iter()
            .map(|seed| {
                let similarity = f64::from(cosine_similarity(&seed.embedding, query_embedding));
                let radius = self.config.min_distance
                    + self.config.initial_spread * (1.0 - similarity.clamp(0.0, 1.0));
                let position = (Vec3::random_unit(&mut rng) * radius)
                    .clamp_cube(self.config.max_distance);
                Particle {
                    id: seed.id,
                    content: seed.content,
                    embedding: seed.embedding,
                    position,
                    velocity: Vec3::ZERO,
                    mass: seed.relevance.max(MIN_MASS),
                    relevance: seed.relevance,
                    similarity,
                    metadata: seed.metadata,
                }
            })
            .collect()
    }

    /// Run until convergence, the iteration cap, or the time limit.
    pub fn simulate(&self, particles: &mut [Particle], query_embedding: &[f32]) -> AimosResult<DvnsMetrics> {
        if particles.is_empty() {
            return Err(AimosError::validation("DVNS needs at least one particle"));
        }
        if query_embedding.is_empty() {
            return Err(AimosError::validation("DVNS needs a query embedding"));
        }
        let cfg = &self.config;
        let started = Instant::now();
        let deadline = cfg.time_limit_ms.map(Duration::from_millis);
        let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));

        for p in particles.iter_mut() {
            p.similarity = f64::from(cosine_similarity(&p.embedding, query_embedding));
        }
        let n = particles.len();
        let pair_sim = pairwise_similarity(particles);
        let neighbours = structural_neighbours(particles, &pair_sim);
        let conflicts: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| {
                        j != i
                            && (pair_sim[i][j] < NEGATIVE_SIMILARITY
                                || particles[i].conflicts_with(&particles[j]))
                    })
                    .collect()
            })
            .collect();
        let origin: Vec<Vec3> = particles.iter().map(|p| p.position).collect();

        let mut metrics = DvnsMetrics {
            iterations: 0,
            converged: false,
            termination: Termination::MaxIterations,
            max_velocity: 0.0,
            avg_velocity: 0.0,
            avg_displacement: 0.0,
            total_displacement: 0.0,
            elapsed_ms: 0,
        };

        for _ in 0..cfg.max_iterations {
            if deadline.is_some_and(|d| started.elapsed() >= d) {
                metrics.termination = Termination::TimeLimit;
                break;
            }
            let forces: Vec<Vec3> = (0..n)
                .map(|i| self.force_on(i, particles, &pair_sim, &neighbours[i], &conflicts[i], &mut rng))
                .collect();

            let mut max_v = 0.0f64;
            let mut sum_v = 0.0;
            let mut sum_disp = 0.0;
            for (p, force) in particles.iter_mut().zip(forces) {
                let accel = force * (1.0 / p.mass);
                p.velocity = (p.velocity + accel * cfg.dt).clamp_norm(cfg.max_velocity);
                let before = p.position;
                p.position = (p.position + p.velocity * cfg.dt).clamp_cube(cfg.max_distance);
                let speed = p.velocity.norm();
                max_v = max_v.max(speed);
                sum_v += speed;
                sum_disp += (p.position - before).norm();
            }
            metrics.iterations += 1;
            metrics.max_velocity = max_v;
            metrics.avg_velocity = sum_v / n as f64;
            metrics.avg_displacement = sum_disp / n as f64;

            if max_v < cfg.convergence_velocity {
                metrics.converged = true;
                metrics.termination = Termination::Converged;
                break;
            }
        }

        metrics.total_displacement = particles
            .iter()
            .zip(&origin)
            .map(|(p, o)| (p.position - *o).norm())
            .sum::<f64>()
            / n as f64;
        metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            particles = n,
            iterations = metrics.iterations,
            converged = metrics.converged,
            max_velocity = metrics.max_velocity,
            "DVNS simulation finished"
        );
        Ok(metrics)
    }

    fn force_on(
        &self,
        i: usize,
        particles: &[Particle],
        pair_sim: &[Vec<f64>],
        neighbours: &[usize],
        conflicts: &[usize],
        rng: &mut StdRng,
    ) -> Vec3 {
        let cfg = &self.config;
        let p = &particles[i];
        let mut force = Vec3::ZERO;

        // Anchor gravity: linear pull toward the origin, scaled by similarity.
        if p.similarity > 0.0 {
            force += (Vec3::ZERO - p.position) * (cfg.gravity_strength * p.mass * p.similarity);
        }

        for (j, other) in particles.iter().enumerate() {
            if j == i || pair_sim[i][j] < cfg.pairwise_similarity_threshold {
                continue;
            }
            let delta = other.position - p.position;
            let dist = delta.norm().max(cfg.min_distance);
            let magnitude = cfg.gravity_strength * p.mass * other.mass * pair_sim[i][j] / (dist * dist);
            force += delta * (magnitude / dist);
        }

        for &j in neighbours {
            let delta = particles[j].position - p.position;
            let dist = delta.norm();
            if dist > 1e-9 {
                force += delta * (cfg.elastic_strength * (dist - cfg.rest_length) / dist);
            }
        }

        for &j in conflicts {
            let delta = p.position - particles[j].position;
            let dist = delta.norm();
            let direction = if dist < 1e-9 {
                Vec3::random_unit(rng)
            } else {
                delta * (1.0 / dist)
            };
            force += direction * (cfg.repulse_strength / (dist * dist + cfg.repulse_softening));
        }

        force + p.velocity * (-cfg.damping)
    }
}

fn pairwise_similarity(particles: &[Particle]) -> Vec<Vec<f64>> {
    let n = particles.len();
    let mut sim = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let s = f64::from(cosine_similarity(&particles[i].embedding, &particles[j].embedding));
            sim[i][j] = s;
            sim[j][i] = s;
        }
    }
    sim
}

/// Same-document particles are linked; orphans link to their most similar peers.
fn structural_neighbours(particles: &[Particle], pair_sim: &[Vec<f64>]) -> Vec<Vec<usize>> {
    let n = particles.len();
    (0..n)
        .map(|i| match particles[i].doc_key() {
            Some(doc) => (0..n)
                .filter(|&j| j != i && particles[j].doc_key() == Some(doc))
                .collect(),
            None => {
                let mut others: Vec<usize> = (0..n).filter(|&j| j != i).collect();
                others.sort_by(|&a, &b| pair_sim[i][b].total_cmp(&pair_sim[i][a]).then(a.cmp(&b)));
                others.truncate(FALLBACK_NEIGHBOURS);
                others
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed(id: &str, embedding: Vec<f32>, relevance: f64) -> ParticleSeed {
        ParticleSeed {
            id: id.to_string(),
            content: id.to_string(),
            embedding,
            relevance,
            metadata: BTreeMap::from([("doc_id".to_string(), json!("d"))]),
        }
    }

    fn seeds() -> Vec<ParticleSeed> {
        vec![
            seed("close", vec![1.0, 0.1, 0.0], 0.9),
            seed("mid", vec![0.5, 0.5, 0.2], 0.5),
            seed("far", vec![0.1, 1.0, 0.3], 0.2),
        ]
    }

    #[test]
    fn test_rejects_empty_inputs() {
        let physics = DvnsPhysics::new(DvnsConfig::default());
        let mut none: Vec<Particle> = Vec::new();
        assert!(physics.simulate(&mut none, &[1.0]).is_err());
        let mut some = physics.create_particles(seeds(), &[1.0, 0.0, 0.0]);
        assert_eq!(physics.simulate(&mut some, &[]).unwrap_err().kind(), "validation_error");
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let physics = DvnsPhysics::new(DvnsConfig::default());
        let query = [1.0, 0.0, 0.0];
        let mut a = physics.create_particles(seeds(), &query);
        let mut b = physics.create_particles(seeds(), &query);
        let ma = physics.simulate(&mut a, &query).unwrap();
        let mb = physics.simulate(&mut b, &query).unwrap();
        assert_eq!(ma.iterations, mb.iterations);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.position, y.position);
        }
    }

    #[test]
    fn test_relevant_particle_ends_nearest_anchor() {
        let physics = DvnsPhysics::new(DvnsConfig::default());
        let query = [1.0, 0.0, 0.0];
        let mut particles = physics.create_particles(seeds(), &query);
        physics.simulate(&mut particles, &query).unwrap();
        let close = particles.iter().find(|p| p.id == "close").unwrap();
        let far = particles.iter().find(|p| p.id == "far").unwrap();
        assert!(close.anchor_distance() < far.anchor_distance());
    }

    #[test]
    fn test_bounds_respected() {
        let config = DvnsConfig {
            max_iterations: 5,
            max_velocity: 0.5,
            max_distance: 2.0,
            initial_spread: 50.0,
            ..DvnsConfig::default()
        };
        let physics = DvnsPhysics::new(config);
        let query = [1.0, 0.0, 0.0];
        let mut particles = physics.create_particles(seeds(), &query);
        let metrics = physics.simulate(&mut particles, &query).unwrap();
        assert!(metrics.iterations <= 5);
        assert!(metrics.max_velocity <= 0.5 + 1e-9);
        for p in &particles {
            assert!(p.position.x.abs() <= 2.0 && p.position.y.abs() <= 2.0 && p.position.z.abs() <= 2.0);
        }
    }

    #[test]
    fn test_opposite_stances_repel() {
        let mut a = seed("a", vec![1.0, 0.0], 0.8);
        let mut b = seed("b", vec![1.0, 0.0], 0.8);
        a.metadata.insert("topic".into(), json!("beta stability"));
        a.metadata.insert("stance".into(), json!("supports"));
        b.metadata.insert("topic".into(), json!("beta stability"));
        b.metadata.insert("stance".into(), json!("refutes"));
        let physics = DvnsPhysics::new(DvnsConfig::default());
        let particles = physics.create_particles(vec![a, b], &[1.0, 0.0]);
        assert!(particles[0].conflicts_with(&particles[1]));
    }

    #[test]
    fn test_time_limit_terminates() {
        let config = DvnsConfig {
            time_limit_ms: Some(0),
            ..DvnsConfig::default()
        };
        let physics = DvnsPhysics::new(config);
        let query = [1.0, 0.0, 0.0];
        let mut particles = physics.create_particles(seeds(), &query);
        let metrics = physics.simulate(&mut particles, &query).unwrap();
        assert_eq!(metrics.termination, Termination::TimeLimit);
        assert_eq!(metrics.iterations, 0);
    }
}
