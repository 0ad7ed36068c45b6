use crate::backend::{CommDataType, ReduceOp};
use bytemuck::Pod;
use half::{bf16, f16};

trait Element: Pod {
    fn combine(self, other: Self, op: ReduceOp) -> Self;
    fn divide(self, count: usize) -> Self;
}

macro_rules! int_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                fn combine(self, other: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg => self.wrapping_add(other),
                        ReduceOp::Prod => self.wrapping_mul(other),
                        ReduceOp::Max => Ord::max(self, other),
                        ReduceOp::Min => Ord::min(self, other),
                    }
                }

                fn divide(self, count: usize) -> Self {
                    // Widened so that the rank count is never truncated.
                    (self as i128 / count as i128) as $ty
                }
            }
        )*
    };
}

macro_rules! float_element {
    ($($ty:ty => $from_count:expr),*) => {
        $(
            impl Element for $ty {
                fn combine(self, other: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg => self + other,
                        ReduceOp::Prod => self * other,
                        ReduceOp::Max => if other > self { other } else { self },
                        ReduceOp::Min => if other < self { other } else { self },
                    }
                }

                fn divide(self, count: usize) -> Self {
                    let from_count: fn(usize) -> $ty = $from_count;
                    self / from_count(count)
                }
            }
        )*
    };
}

int_element!(i8, u8, i32, u32, i64, u64);
float_element!(
    f32 => |n| n as f32,
    f64 => |n| n as f64,
    f16 => |n| f16::from_f64(n as f64),
    bf16 => |n| bf16::from_f64(n as f64)
);

fn reduce_typed<E: Element>(contributions: &[Vec<u8>], op: ReduceOp) -> Vec<u8> {
    let size = core::mem::size_of::<E>();
    let mut acc = contributions[0].clone();

    for other in &contributions[1..] {
        for (lhs, rhs) in acc.chunks_exact_mut(size).zip(other.chunks_exact(size)) {
            let value = bytemuck::pod_read_unaligned::<E>(lhs)
                .combine(bytemuck::pod_read_unaligned::<E>(rhs), op);
            lhs.copy_from_slice(bytemuck::bytes_of(&value));
        }
    }

    if let ReduceOp::Avg = op {
        for value in acc.chunks_exact_mut(size) {
            let mean = bytemuck::pod_read_unaligned::<E>(value).divide(contributions.len());
            value.copy_from_slice(bytemuck::bytes_of(&mean));
        }
    }

    acc
}

/// Reduce the contributions of every rank element-wise, in rank order.
pub(crate) fn reduce(dtype: CommDataType, op: ReduceOp, contributions: &[Vec<u8>]) -> Vec<u8> {
    if contributions.is_empty() {
        return Vec::new();
    }

    match dtype {
        CommDataType::I8 => reduce_typed::<i8>(contributions, op),
        CommDataType::U8 => reduce_typed::<u8>(contributions, op),
        CommDataType::I32 => reduce_typed::<i32>(contributions, op),
        CommDataType::U32 => reduce_typed::<u32>(contributions, op),
        CommDataType::I64 => reduce_typed::<i64>(contributions, op),
        CommDataType::U64 => reduce_typed::<u64>(contributions, op),
        CommDataType::F16 => reduce_typed::<f16>(contributions, op),
        CommDataType::BF16 => reduce_typed::<bf16>(contributions, op),
        CommDataType::F32 => reduce_typed::<f32>(contributions, op),
        CommDataType::F64 => reduce_typed::<f64>(contributions, op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes<T: Pod>(values: &[T]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    fn values<T: Pod>(bytes: &[u8]) -> Vec<T> {
        bytes
            .chunks_exact(core::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    #[test]
    fn sum_f32() {
        let contributions = [1.0f32, 2.0, 3.0, 4.0].map(|v| bytes(&[v, -v]));
        let out = reduce(CommDataType::F32, ReduceOp::Sum, &contributions);

        assert_eq!(values::<f32>(&out), [10.0, -10.0]);
    }

    #[test]
    fn max_min_i64() {
        let contributions = [bytes(&[3i64, -7]), bytes(&[5i64, -9]), bytes(&[1i64, 2])];

        let max = reduce(CommDataType::I64, ReduceOp::Max, &contributions);
        let min = reduce(CommDataType::I64, ReduceOp::Min, &contributions);

        assert_eq!(values::<i64>(&max), [5, 2]);
        assert_eq!(values::<i64>(&min), [1, -9]);
    }

    #[test]
    fn avg_f16() {
        let contributions = [f16::from_f32(1.0), f16::from_f32(3.0)].map(|v| bytes(&[v]));
        let out = reduce(CommDataType::F16, ReduceOp::Avg, &contributions);

        assert_eq!(values::<f16>(&out), [f16::from_f32(2.0)]);
    }

    #[test_log::test]
    fn integer_avg_divides_by_the_full_count() {
        let mut contributions = vec![bytes(&[0u8]); 256];
        contributions[0] = bytes(&[200u8]);
        let out = reduce(CommDataType::U8, ReduceOp::Avg, &contributions);
        assert_eq!(out, [0]);

        let mut contributions = vec![bytes(&[0i8]); 130];
        contributions[0] = bytes(&[127i8]);
        let out = reduce(CommDataType::I8, ReduceOp::Avg, &contributions);
        assert_eq!(values::<i8>(&out), [0]);

        let contributions = [bytes(&[7i32]), bytes(&[-1i32]), bytes(&[3i32])];
        let out = reduce(CommDataType::I32, ReduceOp::Avg, &contributions);
        assert_eq!(values::<i32>(&out), [3]);
    }

    #[test]
    fn prod_u8() {
        let contributions = [bytes(&[2u8, 3]), bytes(&[4u8, 5])];
        let out = reduce(CommDataType::U8, ReduceOp::Prod, &contributions);

        assert_eq!(out, [8, 15]);
    }
}
