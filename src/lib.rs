/*!
Weakly compressible SPH in a 2D channel that is periodic in x.

Obstacles come from a binary occupancy mask. The mask is turned into a signed
distance field (used as a last-resort collision clamp) and into a layer of
static boundary particles (used for the actual wall pressure).

```text
OccupancyMask -> SignedDistanceField ----------------> collision clamp
              -> BoundaryField (positions, psi) ------> density / pressure forces
SimulationParams -> DerivedQuantities -> TimestepSchedule -> substeps per frame
```

*/

/*
Notes:
    boundary particles mirror the pressure of the fluid particle that queries them
    (p_b = p_i, rho_b = rest density), there is no boundary pressure state

    the density pass never reads the density of the previous substep, so all
    per-particle kernels are order independent within one pass

TODO:
    boundary placement uses a coarse pixel stride, interface rows that are not a
    multiple of the stride get no boundary particles (collision clamp catches those)
*/

mod platform;
mod simulation;

pub use simulation::*;

pub use platform::start;
