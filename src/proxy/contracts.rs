//! ABI bindings of the bridge head and validator contracts

use ethers::contract::abigen;

abigen!(
    BridgeHeadContract,
    r#"[
        function merkleRoot() external view returns (bytes32)
        function locked() external view returns (bool)
        function lastLockedBlock() external view returns (uint256)
        function lastSnapshotBlock() external view returns (uint256)
        function snapshots(bytes32 root) external view returns (bytes32 parentRoot, uint256 blockNum)
        event BridgeLocked(bytes32 indexed root)
        event MerkleRootUpdated(bytes32 indexed parentRoot, bytes32 indexed root)
        event Swap(address indexed sender, address indexed recipient, address indexed token, uint256 amount, uint256 reward, uint256 amountOut, uint256 swapCount)
        event Claim(bytes32 indexed swapTxHash, address indexed recipient, address indexed token, uint256 amount)
        event HashCommitted(bytes32 indexed appid, bytes32 hash)
    ]"#
);

abigen!(
    ValidatorContract,
    r#"[
        function getValidators() external view returns (address[] accounts, uint8[] statuses, uint256[] updateBlocks)
        function getLockBridgeProposal(bytes32 root) external view returns (bool executed, bytes[] signatures)
        function getMerkleRootProposal(bytes32 root) external view returns (bool executed, bytes[] signatures)
        function lockBridge(bytes32 root, bytes[] signatures) external
        function updateBridgeMerkleRoot(bytes32 parentRoot, bytes32 newRoot, bytes[] signatures) external
    ]"#
);
