//! Convolution Node
//!
//! 2-D convolution `Conv(X, W, B?)` with explicit or automatic padding.
//! The primitive chooses a channels-last layout for its source and
//! destination, so inputs are reordered to match.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Arg, ConvolutionParams, MemoryDesc, PrimitiveDesc, PrimitiveKind};

use super::{bind_output, push_primitive, reorder_to};
use crate::accumulator::PrimitiveAccumulator;
use crate::error::{GraphError, GraphResult};
use crate::node::{AttrReader, LoweringContext, Node, PrimitiveNode};
use crate::tensor::{fixed_dims, TensorArena};

/// Automatic padding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoPad {
    /// Use the explicit `pads` attribute.
    #[default]
    NotSet,
    /// No padding.
    Valid,
    /// Pad so `out = ceil(in / stride)`, extra padding at the end.
    SameUpper,
    /// Pad so `out = ceil(in / stride)`, extra padding at the start.
    SameLower,
}

/// A 2-D convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvNode {
    /// Stride along H and W.
    pub strides: [usize; 2],
    /// Explicit leading padding along H and W.
    pub pads_begin: [usize; 2],
    /// Explicit trailing padding along H and W.
    pub pads_end: [usize; 2],
    /// Dilation along H and W.
    pub dilations: [usize; 2],
    /// Channel groups.
    pub group: usize,
    /// Automatic padding mode.
    pub auto_pad: AutoPad,
}

fn to_pair(name: &str, attribute: &str, values: &[i64]) -> GraphResult<[usize; 2]> {
    match values {
        [h, w] if *h > 0 && *w > 0 => Ok([*h as usize, *w as usize]),
        _ => Err(GraphError::invalid_attribute(
            name,
            attribute,
            format!("expected two positive values, got {values:?}"),
        )),
    }
}

impl ConvNode {
    pub(crate) fn from_attrs(name: &str, attrs: &AttrReader<'_>) -> GraphResult<Self> {
        let strides = to_pair(name, "strides", &attrs.ints("strides")?.unwrap_or(vec![1, 1]))?;
        let dilations = to_pair(name, "dilations", &attrs.ints("dilations")?.unwrap_or(vec![1, 1]))?;
        let pads = attrs.ints("pads")?.unwrap_or(vec![0; 4]);
        let [top, left, bottom, right] = pads.as_slice() else {
            return Err(GraphError::invalid_attribute(
                name,
                "pads",
                format!("expected [top, left, bottom, right], got {pads:?}"),
            ));
        };
        if pads.iter().any(|&p| p < 0) {
            return Err(GraphError::invalid_attribute(name, "pads", "negative padding"));
        }
        let group = attrs.int("group")?.unwrap_or(1);
        if group < 1 {
            return Err(GraphError::invalid_attribute(name, "group", format!("{group}")));
        }
        let auto_pad = match attrs.string("auto_pad")?.as_deref() {
            None | Some("NOTSET" | "") => AutoPad::NotSet,
            Some("VALID") => AutoPad::Valid,
            Some("SAME_UPPER") => AutoPad::SameUpper,
            Some("SAME_LOWER") => AutoPad::SameLower,
            Some(other) => {
                return Err(GraphError::invalid_attribute(
                    name,
                    "auto_pad",
                    format!("unknown mode {other}"),
                ))
            }
        };
        Ok(Self {
            strides,
            pads_begin: [*top as usize, *left as usize],
            pads_end: [*bottom as usize, *right as usize],
            dilations,
            group: group as usize,
            auto_pad,
        })
    }

    /// Convolution geometry for an input extent and kernel extent along H and W.
    #[must_use]
    pub fn params(&self, input: [usize; 2], kernel: [usize; 2]) -> ConvolutionParams {
        let (mut begin, mut end) = (self.pads_begin, self.pads_end);
        for axis in 0..2 {
            match self.auto_pad {
                AutoPad::NotSet => {}
                AutoPad::Valid => {
                    begin[axis] = 0;
                    end[axis] = 0;
                }
                AutoPad::SameUpper | AutoPad::SameLower => {
                    let stride = self.strides[axis];
                    let out = input[axis].div_ceil(stride);
                    let window = (kernel[axis].max(1) - 1) * self.dilations[axis] + 1;
                    let total = ((out.max(1) - 1) * stride + window).saturating_sub(input[axis]);
                    let (small, large) = (total / 2, total - total / 2);
                    if self.auto_pad == AutoPad::SameUpper {
                        begin[axis] = small;
                        end[axis] = large;
                    } else {
                        begin[axis] = large;
                        end[axis] = small;
                    }
                }
            }
        }
        ConvolutionParams {
            strides: self.strides,
            padding_begin: begin,
            padding_end: end,
            dilations: self.dilations,
            groups: self.group,
        }
    }

    fn geometry(&self, node: &Node, arena: &TensorArena) -> GraphResult<(Vec<usize>, ConvolutionParams)> {
        let x = node.input(arena, 0)?.concrete_dims()?;
        let w = node.input(arena, 1)?.concrete_dims()?;
        if x.len() != 4 || w.len() != 4 {
            return Err(GraphError::InvalidGraph(format!(
                "{}: only 2-D convolution is supported, got input {x:?} weights {w:?}",
                node.name
            )));
        }
        let params = self.params([x[2], x[3]], [w[2], w[3]]);
        let mut dims = vec![x[0], w[0]];
        for axis in 0..2 {
            let extent = x[axis + 2] + params.padding_begin[axis] + params.padding_end[axis];
            let window = (w[axis + 2].max(1) - 1) * params.dilations[axis] + 1;
            if extent < window {
                return Err(GraphError::InvalidGraph(format!(
                    "{}: kernel window {window} exceeds padded input extent {extent}",
                    node.name
                )));
            }
            dims.push((extent - window) / params.strides[axis] + 1);
        }
        Ok((dims, params))
    }
}

impl PrimitiveNode for ConvNode {
    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::Convolution
    }

    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
        let (dims, _) = self.geometry(node, arena)?;
        let output = node.output_slot(0)?;
        arena.get_mut(output).set_dims(fixed_dims(&dims));
        Ok(())
    }

    fn generate_primitive(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let (dims, params) = self.geometry(node, cx.arena)?;
        let (x_slot, w_slot) = (node.input_slot(0)?, node.input_slot(1)?);
        let bias_slot = if node.has_input(cx.arena, 2) {
            Some(node.input_slot(2)?)
        } else {
            None
        };

        let src_desc = cx.arena.get(x_slot).input_desc()?;
        let weights_desc = cx.arena.get(w_slot).input_desc()?;
        let bias_desc = match bias_slot {
            Some(slot) => Some(cx.arena.get(slot).input_desc()?),
            None => None,
        };
        let out_slot = node.output_slot(0)?;
        let dst_type = acc.dst_type(cx.arena.get(out_slot).dtype());
        let desc = PrimitiveDesc::convolution(
            src_desc,
            weights_desc,
            bias_desc,
            MemoryDesc::any(&dims, dst_type),
            params,
        )?;

        let mut args = std::mem::take(&mut acc.args);
        args.insert(Arg::Src, reorder_to(cx, x_slot, desc.src_desc())?);
        if let Some(weights) = desc.weights_desc() {
            args.insert(Arg::Weights, reorder_to(cx, w_slot, weights)?);
        }
        if let (Some(slot), PrimitiveDesc::Convolution { bias: Some(bias), .. }) = (bias_slot, &desc) {
            args.insert(Arg::Bias, reorder_to(cx, slot, bias)?);
        }
        args.insert(Arg::Dst, bind_output(cx, out_slot, desc.dst_desc().clone())?);
        push_primitive(cx, desc, acc.attr(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AttributeValue, Attributes};

    fn conv(attributes: &Attributes) -> GraphResult<ConvNode> {
        ConvNode::from_attrs("conv", &AttrReader::new("conv", attributes))
    }

    #[test]
    fn test_default_attributes() {
        let node = conv(&Attributes::default()).unwrap();
        assert_eq!(node.strides, [1, 1]);
        assert_eq!(node.group, 1);
        assert_eq!(node.auto_pad, AutoPad::NotSet);
        assert_eq!(node.params([5, 5], [3, 3]), ConvolutionParams::default());
    }

    #[test]
    fn test_explicit_pads_order() {
        let mut attributes = Attributes::default();
        attributes.insert("pads".to_string(), AttributeValue::Ints(vec![1, 2, 3, 4]));
        let node = conv(&attributes).unwrap();
        assert_eq!(node.pads_begin, [1, 2]);
        assert_eq!(node.pads_end, [3, 4]);
    }

    #[test]
    fn test_same_padding() {
        let mut attributes = Attributes::default();
        attributes.insert("auto_pad".to_string(), AttributeValue::String("SAME_UPPER".to_string()));
        attributes.insert("strides".to_string(), AttributeValue::Ints(vec![2, 2]));
        let upper = conv(&attributes).unwrap().params([4, 4], [3, 3]);
        // out = 2, total padding = (2 - 1) * 2 + 3 - 4 = 1
        assert_eq!(upper.padding_begin, [0, 0]);
        assert_eq!(upper.padding_end, [1, 1]);

        attributes.insert("auto_pad".to_string(), AttributeValue::String("SAME_LOWER".to_string()));
        let lower = conv(&attributes).unwrap().params([4, 4], [3, 3]);
        assert_eq!(lower.padding_begin, [1, 1]);
        assert_eq!(lower.padding_end, [0, 0]);
    }

    #[test]
    fn test_invalid_attributes() {
        let mut attributes = Attributes::default();
        attributes.insert("pads".to_string(), AttributeValue::Ints(vec![1, 1]));
        assert!(conv(&attributes).is_err());

        let mut attributes = Attributes::default();
        attributes.insert("auto_pad".to_string(), AttributeValue::String("FULL".to_string()));
        assert!(conv(&attributes).is_err());
    }
}
