//! Model rewrites that run before scheduling.
//!
//! Three rewrites, all preserving observed tensor semantics: a tensor that
//! is exported or marked as a model output is never eliminated.

use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::model::{ElemStep, Model, Op, OpConfig, OpId, OpType};
use crate::tensor::TensorId;

/// Rewrites the model in place: elides no-op views and identity
/// transposes, then coalesces element-wise chains. Returns the number of
/// ops removed.
pub fn optimize_model(model: &mut Model) -> usize {
    let before = model.ops().len();
    elide_noops(model);
    coalesce_elementwise(model);
    let removed = before - model.ops().len();
    info!("optimize: {before} ops -> {} ops", model.ops().len());
    removed
}

/// True if the op moves no data: identity, no-op reshape, or a transpose
/// with the identity permutation.
fn is_noop(op: &Op, model: &Model) -> bool {
    match op.otype {
        OpType::Identity => true,
        OpType::Reshape => {
            let t_in = model.get_tensor(op.inputs[0]);
            let t_out = model.get_tensor(op.outputs[0]);
            t_in.shape == t_out.shape
        }
        OpType::Transpose => match &op.cfg {
            OpConfig::Transpose(perm) => perm.iter().enumerate().all(|(i, &p)| i == p),
            _ => false,
        },
        _ => false,
    }
}

/// Drops no-op view and identity-transpose ops, redirecting consumers to
/// the op's input. An observed output pins its op in place.
fn elide_noops(model: &mut Model) {
    let mut remap: FxHashMap<TensorId, TensorId> = FxHashMap::default();
    let mut kept = Vec::with_capacity(model.ops().len());

    for op in model.ops().to_vec() {
        let mut op = op;
        // Chase earlier elisions first so chains of aliases collapse.
        for t in op.inputs.iter_mut() {
            while let Some(&root) = remap.get(t) {
                *t = root;
            }
        }
        if is_noop(&op, model) && !model.is_observed(op.outputs[0]) {
            debug!("elide {} op {}", op.otype.name(), op.id.0);
            remap.insert(op.outputs[0], op.inputs[0]);
            continue;
        }
        kept.push(op);
    }
    renumber(&mut kept);
    model.replace_ops(kept);
}

/// Coalesces runs of element-wise ops into a single `FusedElementwise` op.
///
/// A chain starts at any element-wise op and extends through unary
/// element-wise consumers (scale, relu) as long as the intermediate tensor
/// has exactly one consumer and is not externally observed.
fn coalesce_elementwise(model: &mut Model) {
    let ops = model.ops().to_vec();
    let mut consumer_count: FxHashMap<TensorId, usize> = FxHashMap::default();
    for op in &ops {
        for &t in &op.inputs {
            *consumer_count.entry(t).or_insert(0) += 1;
        }
    }
    // Sole consumer of an op's sole output, if it extends a chain.
    let mut next_in_chain: FxHashMap<usize, usize> = FxHashMap::default();
    for (i, op) in ops.iter().enumerate() {
        if !op.otype.is_elementwise() || op.outputs.len() != 1 {
            continue;
        }
        let out = op.outputs[0];
        if model.is_observed(out) || consumer_count.get(&out) != Some(&1) {
            continue;
        }
        let successor = ops.iter().enumerate().find(|(_, c)| c.inputs.contains(&out));
        if let Some((j, c)) = successor {
            // Only unary extensions keep the chain single-valued.
            if matches!(c.otype, OpType::Scale | OpType::Relu) && c.inputs.len() == 1 {
                next_in_chain.insert(i, j);
            }
        }
    }

    let chain_heads: Vec<usize> = (0..ops.len())
        .filter(|i| next_in_chain.contains_key(i))
        .filter(|i| !next_in_chain.values().any(|&j| j == *i))
        .collect();
    if chain_heads.is_empty() {
        return;
    }

    let mut absorbed = vec![false; ops.len()];
    let mut fused: FxHashMap<usize, Op> = FxHashMap::default();
    for &head in &chain_heads {
        let mut steps = vec![step_of(&ops[head])];
        let mut last = head;
        while let Some(&j) = next_in_chain.get(&last) {
            absorbed[j] = true;
            steps.push(step_of(&ops[j]));
            last = j;
        }
        debug!(
            "coalesce ops {}..{} into a {}-step elementwise chain",
            head,
            last,
            steps.len()
        );
        fused.insert(
            head,
            Op {
                id: ops[head].id,
                otype: OpType::FusedElementwise,
                inputs: ops[head].inputs.clone(),
                outputs: ops[last].outputs.clone(),
                cfg: OpConfig::FusedChain(steps),
            },
        );
    }

    let mut kept = Vec::with_capacity(ops.len());
    for (i, op) in ops.into_iter().enumerate() {
        if absorbed[i] {
            continue;
        }
        kept.push(fused.remove(&i).unwrap_or(op));
    }
    renumber(&mut kept);
    model.replace_ops(kept);
}

fn step_of(op: &Op) -> ElemStep {
    let factor = match op.cfg {
        OpConfig::Scale(f) => Some(f),
        _ => None,
    };
    ElemStep {
        op: op.otype,
        factor,
    }
}

fn renumber(ops: &mut [Op]) {
    for (i, op) in ops.iter_mut().enumerate() {
        op.id = OpId(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Dims;
    use crate::tensor::TensorType;

    fn dims(v: &[i64]) -> Dims {
        Dims::new(v.to_vec()).unwrap()
    }

    #[test]
    fn test_identity_transpose_elided() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[4, 8]), TensorType::Fp32).unwrap();
        let t = m.transpose(x, &[0, 1]).unwrap();
        let out = m.relu(t).unwrap();
        m.mark_output(out);

        optimize_model(&mut m);
        assert_eq!(m.ops().len(), 1);
        assert_eq!(m.ops()[0].otype, OpType::Relu);
        assert_eq!(m.ops()[0].inputs, vec![x]);
    }

    #[test]
    fn test_observed_transpose_survives() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[4, 8]), TensorType::Fp32).unwrap();
        let t = m.transpose(x, &[0, 1]).unwrap();
        m.mark_output(t);

        optimize_model(&mut m);
        assert_eq!(m.ops().len(), 1);
        assert_eq!(m.ops()[0].otype, OpType::Transpose);
    }

    #[test]
    fn test_elementwise_chain_coalesced() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[64]), TensorType::Fp32).unwrap();
        let y = m.tensor(dims(&[64]), TensorType::Fp32).unwrap();
        let s = m.add(x, y).unwrap();
        let s = m.scale(s, 0.5).unwrap();
        let s = m.relu(s).unwrap();
        m.mark_output(s);

        optimize_model(&mut m);
        assert_eq!(m.ops().len(), 1);
        let op = &m.ops()[0];
        assert_eq!(op.otype, OpType::FusedElementwise);
        assert_eq!(op.inputs, vec![x, y]);
        assert_eq!(op.outputs, vec![s]);
        match &op.cfg {
            OpConfig::FusedChain(steps) => {
                assert_eq!(steps.len(), 3);
                assert_eq!(steps[0].op, OpType::Add);
                assert_eq!(steps[1].factor, Some(0.5));
            }
            other => panic!("unexpected cfg {other:?}"),
        }
    }

    #[test]
    fn test_chain_stops_at_observed_intermediate() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[64]), TensorType::Fp32).unwrap();
        let a = m.relu(x).unwrap();
        m.mark_output(a); // observed intermediate
        let b = m.scale(a, 2.0).unwrap();
        m.mark_output(b);

        optimize_model(&mut m);
        assert_eq!(m.ops().len(), 2);
    }

    #[test]
    fn test_chain_stops_at_fanout() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[64]), TensorType::Fp32).unwrap();
        let a = m.relu(x).unwrap();
        let b = m.scale(a, 2.0).unwrap();
        let c = m.scale(a, 3.0).unwrap(); // second consumer of a
        m.mark_output(b);
        m.mark_output(c);

        optimize_model(&mut m);
        assert_eq!(m.ops().len(), 3);
    }
}
