// Test modules for chatsync
// Cross-component scenario tests; per-module unit tests live beside each module
