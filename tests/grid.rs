use slabhash::grid::VoxelBlockGrid;
use slabhash::{Device, Dtype, Error, HashBackend, Tensor};

mod common;

fn grid(backend: HashBackend) -> VoxelBlockGrid {
    VoxelBlockGrid::new(
        &["tsdf", "weight", "color"],
        &[Dtype::Float32, Dtype::Float32, Dtype::UInt8],
        &[vec![1], vec![1], vec![3]],
        0.125,
        4,
        64,
        Device::CPU,
        backend,
    )
    .unwrap()
}

fn with_grid(mut test: impl FnMut(VoxelBlockGrid)) {
    for backend in [HashBackend::Chained, HashBackend::Slab] {
        test(grid(backend));
    }
}

fn blocks(coords: &[[i32; 3]]) -> Tensor {
    let flat = coords.iter().flatten().copied().collect::<Vec<_>>();
    Tensor::from_slice(&flat, &[coords.len(), 3], Device::CPU).unwrap()
}

#[test]
fn new() {
    with_grid(|grid| {
        assert_eq!(grid.block_resolution(), 4);
        assert_eq!(grid.voxel_size(), 0.125);
        assert_eq!(grid.attr_names(), ["tsdf", "weight", "color"]);
        assert!(grid.hashmap().is_empty());

        assert_eq!(grid.attribute("tsdf").unwrap().shape(), &[64, 4, 4, 4, 1]);
        assert_eq!(grid.attribute("color").unwrap().shape(), &[64, 4, 4, 4, 3]);
        assert!(matches!(grid.attribute("normal"), Err(Error::InvalidArgument(_))));
    });
}

#[test]
fn invalid_config() {
    let mismatched = VoxelBlockGrid::new(
        &["tsdf", "weight"],
        &[Dtype::Float32],
        &[vec![1], vec![1]],
        0.1,
        8,
        16,
        Device::CPU,
        HashBackend::Default,
    );
    assert!(matches!(mismatched, Err(Error::Config(_))));

    let flat = VoxelBlockGrid::new(
        &["tsdf"],
        &[Dtype::Float32],
        &[vec![1]],
        0.0,
        8,
        16,
        Device::CPU,
        HashBackend::Default,
    );
    assert!(matches!(flat, Err(Error::Config(_))));
}

#[test]
fn touch() {
    with_grid(|grid| {
        // Block size 0.5, truncation 0.75: a point at 0.125 reaches blocks -2 to 1 along
        // every axis.
        let touched = grid.touch(&[[0.125, 0.125, 0.125]]).unwrap();
        assert_eq!(touched.shape(), &[64, 3]);

        let mut coords = touched
            .to_vec::<i32>()
            .unwrap()
            .chunks(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect::<Vec<_>>();
        coords.sort_unstable();
        assert_eq!(coords.first(), Some(&[-2, -2, -2]));
        assert_eq!(coords.last(), Some(&[1, 1, 1]));

        // Overlapping points do not produce duplicate blocks.
        let both = grid
            .touch(&[[0.125, 0.125, 0.125], [0.1875, 0.125, 0.125]])
            .unwrap();
        assert_eq!(both.shape(), &[64, 3]);

        let none = grid.touch(&[]).unwrap();
        assert_eq!(none.shape(), &[0, 3]);
    });
}

#[test]
fn activate() {
    with_grid(|mut grid| {
        let coords = blocks(&[[0, 0, 0], [1, 0, 0], [0, 0, 0]]);
        let indices = grid.activate(&coords).unwrap().to_vec::<i32>().unwrap();

        assert_eq!(grid.hashmap().len(), 2);
        assert_eq!(indices[0], indices[2]);
        assert_ne!(indices[0], indices[1]);

        // Write a voxel, then activate the same block again.
        let slot = indices[1] as usize;
        grid.attribute_mut("tsdf").unwrap().as_mut_slice::<f32>().unwrap()[slot * 64 + 5] = 0.25;

        let again = grid.activate(&blocks(&[[1, 0, 0]])).unwrap();
        assert_eq!(again.to_vec::<i32>().unwrap(), [indices[1]]);

        let tsdf = grid.attribute("tsdf").unwrap();
        assert_eq!(tsdf.as_slice::<f32>().unwrap()[slot * 64 + 5], 0.25);
    });
}

#[test]
fn voxels() {
    with_grid(|mut grid| {
        let indices = grid
            .activate(&blocks(&[[2, -1, 0]]))
            .unwrap()
            .to_vec::<i32>()
            .unwrap();

        let voxels = grid.voxel_indices();
        assert_eq!(voxels.len(), 64);
        assert!(voxels.iter().all(|v| v[0] == indices[0] as i64));
        assert_eq!(voxels[0][1..], [0, 0, 0]);
        assert_eq!(voxels[1][1..], [1, 0, 0]);
        assert_eq!(voxels[4][1..], [0, 1, 0]);
        assert_eq!(voxels[63][1..], [3, 3, 3]);

        let coords = grid.voxel_coordinates(&voxels).unwrap();
        assert_eq!(coords[0], [8, -4, 0]);
        assert_eq!(coords[63], [11, -1, 3]);

        assert!(grid.voxel_coordinates(&[[1000, 0, 0, 0]]).is_err());
        assert!(grid.voxel_coordinates(&[[-1, 0, 0, 0]]).is_err());
    });
}

#[test]
fn neighbors() {
    with_grid(|mut grid| {
        let indices = grid
            .activate(&blocks(&[[0, 0, 0], [1, 0, 0], [0, 0, -1]]))
            .unwrap()
            .to_vec::<i32>()
            .unwrap();

        let center = indices[0] as u32;
        let (slots, masks) = grid.buffer_radius_neighbors(&[center]).unwrap();
        assert_eq!(slots.len(), 27);
        assert_eq!(masks.iter().filter(|&&m| m).count(), 3);

        // Neighbour 13 is the block itself, 14 is +x and 4 is -z.
        assert_eq!((slots[13], masks[13]), (indices[0], true));
        assert_eq!((slots[14], masks[14]), (indices[1], true));
        assert_eq!((slots[4], masks[4]), (indices[2], true));
        assert!(!masks[12]);

        // Results are laid out neighbour-major.
        let active = indices.iter().map(|&i| i as u32).collect::<Vec<_>>();
        let (slots, masks) = grid.buffer_radius_neighbors(&active).unwrap();
        assert_eq!(slots.len(), 27 * 3);
        assert_eq!(&slots[13 * 3..14 * 3], &indices[..]);
        assert!(masks[13 * 3..14 * 3].iter().all(|&m| m));

        assert_eq!(grid.buffer_radius_neighbors(&[]).unwrap().0.len(), 0);

        // Slots past the capacity are rejected like in `voxel_coordinates`.
        assert!(matches!(
            grid.buffer_radius_neighbors(&[center, 64]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            grid.voxel_coordinates(&[[64, 0, 0, 0]]),
            Err(Error::InvalidArgument(_))
        ));
    });
}

#[test]
fn save_and_load() {
    let mut run = 0;
    with_grid(|mut grid| {
        let indices = grid
            .activate(&blocks(&[[3, 3, 3], [-3, 0, 9]]))
            .unwrap()
            .to_vec::<i32>()
            .unwrap();

        let slot = indices[1] as usize;
        grid.attribute_mut("color").unwrap().as_mut_slice::<u8>().unwrap()[slot * 192] = 200;

        run += 1;
        let dir = std::env::temp_dir().join(format!("slabhash-grid-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("grid-{}.json", run));
        grid.save(&path).unwrap();

        let loaded = VoxelBlockGrid::load(&path, Device::CPU).unwrap();
        assert_eq!(loaded.attr_names(), grid.attr_names());
        assert_eq!(loaded.voxel_size(), 0.125);
        assert_eq!(loaded.block_resolution(), 4);
        assert_eq!(loaded.hashmap().len(), 2);
        assert_eq!(loaded.hashmap().backend(), grid.hashmap().backend());

        let (mut found, mut masks) = common::outputs();
        loaded
            .hashmap()
            .find(&blocks(&[[-3, 0, 9]]), &mut found, &mut masks)
            .unwrap();
        let slot = found.to_vec::<i32>().unwrap()[0] as usize;
        let color = loaded.attribute("color").unwrap();
        assert_eq!(color.as_slice::<u8>().unwrap()[slot * 192], 200);

        std::fs::remove_file(&path).unwrap();
    });
}
