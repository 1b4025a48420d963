// Queue family negotiation
//
// Each capability is resolved in three passes, first match wins:
//   1. isolated  - has the capability and lacks the other one
//   2. relaxed   - has the capability, family not yet claimed
//   3. shared    - has the capability, may overlap an earlier claim
// Within a pass the family with the most queues wins; ties keep the lower index.

use ash::vk;

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Compute,
    Graphics,
}

impl Capability {
    fn flag(self) -> vk::QueueFlags {
        match self {
            Capability::Compute => vk::QueueFlags::COMPUTE,
            Capability::Graphics => vk::QueueFlags::GRAPHICS,
        }
    }

    fn other(self) -> Capability {
        match self {
            Capability::Compute => Capability::Graphics,
            Capability::Graphics => Capability::Compute,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::Compute => "compute",
            Capability::Graphics => "graphics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Isolated,
    Relaxed,
    Shared,
}

/// Queues reserved for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyAssignment {
    pub capability: Capability,
    pub family_index: u32,
    pub queue_count: u32,
    /// First queue index inside the family.
    pub first_queue: u32,
    /// Position of the first queue in the device's flat queue array.
    pub offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueRequest {
    pub capability: Capability,
    /// `None` takes every queue in the family.
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct QueuePlan {
    assignments: Vec<QueueFamilyAssignment>,
}

impl QueuePlan {
    pub fn get(&self, capability: Capability) -> Option<&QueueFamilyAssignment> {
        self.assignments.iter().find(|a| a.capability == capability)
    }

    pub fn assignments(&self) -> &[QueueFamilyAssignment] {
        &self.assignments
    }

    pub fn total_queues(&self) -> u32 {
        self.assignments.iter().map(|a| a.queue_count).sum()
    }

    /// `(family, queue count)` per distinct family, in first-claim order.
    pub fn family_queue_counts(&self) -> Vec<(u32, u32)> {
        let mut out: Vec<(u32, u32)> = Vec::new();
        for a in &self.assignments {
            match out.iter_mut().find(|(f, _)| *f == a.family_index) {
                Some((_, count)) => *count += a.queue_count,
                None => out.push((a.family_index, a.queue_count)),
            }
        }
        out
    }
}

/// Index of the best family for `capability`, or `None`.
pub fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    capability: Capability,
    claimed: &[u32],
) -> Option<u32> {
    [Pass::Isolated, Pass::Relaxed, Pass::Shared]
        .into_iter()
        .find_map(|pass| best_in_pass(families, capability, claimed, pass))
}

fn best_in_pass(
    families: &[vk::QueueFamilyProperties],
    capability: Capability,
    claimed: &[u32],
    pass: Pass,
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;
    for (i, family) in families.iter().enumerate() {
        let index = i as u32;
        if family.queue_count == 0 || !family.queue_flags.contains(capability.flag()) {
            continue;
        }
        if pass == Pass::Isolated && family.queue_flags.contains(capability.other().flag()) {
            continue;
        }
        if pass != Pass::Shared && claimed.contains(&index) {
            continue;
        }
        if best.map_or(true, |(_, count)| family.queue_count > count) {
            best = Some((index, family.queue_count));
        }
    }
    best.map(|(index, _)| index)
}

/// Resolve every request to a family and lay the queues out in one flat array.
pub fn negotiate(
    families: &[vk::QueueFamilyProperties],
    requests: &[QueueRequest],
) -> Result<QueuePlan> {
    let mut assignments: Vec<QueueFamilyAssignment> = Vec::with_capacity(requests.len());

    for request in requests {
        let claimed: Vec<u32> = assignments.iter().map(|a| a.family_index).collect();
        let family_index = find_queue_family(families, request.capability, &claimed).ok_or_else(|| {
            RuntimeError::init_failed("queue family", request.capability.name(), "no qualifying queue family")
        })?;
        let available = families[family_index as usize].queue_count;

        let mut assignment = QueueFamilyAssignment {
            capability: request.capability,
            family_index,
            queue_count: request.count.unwrap_or(available).clamp(1, available),
            first_queue: 0,
            offset: 0,
        };

        if let Some(owner) = assignments.iter_mut().find(|a| a.family_index == family_index) {
            // Shared family: carve one queue off the tail of the earlier claim.
            if owner.queue_count < 2 {
                return Err(RuntimeError::init_failed(
                    "queue family",
                    family_index.to_string(),
                    format!(
                        "not enough queues to share between {} and {}",
                        owner.capability.name(),
                        request.capability.name()
                    ),
                ));
            }
            owner.queue_count -= 1;
            assignment.queue_count = 1;
            assignment.first_queue = owner.first_queue + owner.queue_count;
        }

        assignments.push(assignment);
    }

    let mut offset = 0;
    for a in assignments.iter_mut() {
        a.offset = offset;
        offset += a.queue_count;
    }

    for a in &assignments {
        log::debug!(
            "{} queues: family {} [{}..{}) at flat offset {}",
            a.capability.name(),
            a.family_index,
            a.first_queue,
            a.first_queue + a.queue_count,
            a.offset
        );
    }

    Ok(QueuePlan { assignments })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(0b111);
    const CT: vk::QueueFlags = vk::QueueFlags::from_raw(0b110);
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    fn compute_and_graphics() -> [QueueRequest; 2] {
        [
            QueueRequest { capability: Capability::Compute, count: None },
            QueueRequest { capability: Capability::Graphics, count: Some(1) },
        ]
    }

    #[test]
    fn discrete_layout_isolates_compute() {
        let families = [family(GCT, 16), family(T, 2), family(CT, 8)];
        let plan = negotiate(&families, &compute_and_graphics()).unwrap();

        let compute = plan.get(Capability::Compute).unwrap();
        let graphics = plan.get(Capability::Graphics).unwrap();
        assert_eq!((compute.family_index, compute.queue_count, compute.offset), (2, 8, 0));
        assert_eq!((graphics.family_index, graphics.queue_count, graphics.offset), (0, 1, 8));
        assert_eq!(plan.total_queues(), 9);
    }

    #[test]
    fn single_family_is_shared_with_one_graphics_queue() {
        let families = [family(GCT, 4)];
        let plan = negotiate(&families, &compute_and_graphics()).unwrap();

        let compute = plan.get(Capability::Compute).unwrap();
        let graphics = plan.get(Capability::Graphics).unwrap();
        assert_eq!(compute.family_index, graphics.family_index);
        assert_eq!(compute.queue_count + graphics.queue_count, 4);
        assert_eq!(graphics.queue_count, 1);
        // ranges do not overlap
        assert_eq!(compute.first_queue + compute.queue_count, graphics.first_queue);
        assert_eq!(plan.family_queue_counts(), vec![(0, 4)]);
        assert_eq!(graphics.offset, compute.queue_count);
    }

    #[test]
    fn shared_family_with_one_queue_fails() {
        let families = [family(GCT, 1)];
        let err = negotiate(&families, &compute_and_graphics()).unwrap_err();
        assert!(err.to_string().contains("not enough queues"));
    }

    #[test]
    fn missing_capability_fails() {
        let families = [family(T, 2)];
        let err = negotiate(&families, &[QueueRequest { capability: Capability::Compute, count: None }])
            .unwrap_err();
        assert!(err.to_string().contains("no qualifying queue family"));
    }

    #[test]
    fn most_queues_wins_and_ties_keep_lower_index() {
        let families = [family(CT, 2), family(CT, 8), family(CT, 8)];
        assert_eq!(find_queue_family(&families, Capability::Compute, &[]), Some(1));
        assert_eq!(find_queue_family(&families, Capability::Compute, &[1]), Some(2));
    }

    #[test]
    fn isolation_beats_queue_count() {
        let families = [family(GCT, 16), family(CT, 1)];
        assert_eq!(find_queue_family(&families, Capability::Compute, &[]), Some(1));
    }

    #[test]
    fn compute_family_honours_requested_count() {
        let families = [family(GCT, 16), family(T, 1), family(CT, 4)];
        for requested in 1..=4 {
            let plan = negotiate(
                &families,
                &[QueueRequest { capability: Capability::Compute, count: Some(requested) }],
            )
            .unwrap();
            let compute = plan.get(Capability::Compute).unwrap();
            assert!(families[compute.family_index as usize].queue_count >= compute.queue_count);
            assert_eq!(compute.queue_count, requested);
        }
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [family(CT, 0), family(GCT, 2)];
        assert_eq!(find_queue_family(&families, Capability::Compute, &[]), Some(1));
    }
}
